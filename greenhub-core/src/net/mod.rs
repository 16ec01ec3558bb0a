use crate::common::Named;
use crate::error::{HubError, Result};
use std::fmt::{Debug, Display, Formatter};
use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::str::FromStr;
use std::time::Duration;

/// `select(2)` backend.
pub mod select;

/// `poll(2)` backend.
pub mod poll;

/// `epoll(7)` backend.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod epoll;

/// `kqueue(2)` backend.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "tvos",
    target_os = "watchos",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd",
    target_os = "netbsd"
))]
pub mod kqueue;

/// Adapter onto a host supplied event loop.
pub mod external;

/// A host event loop built on `polling`.
#[cfg(feature = "host-loop")]
pub mod host;

/// The readiness direction a fiber waits for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Direction {
    /// readable
    Read,
    /// writable
    Write,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// The common contract of every readiness backend.
pub trait Multiplexer: Debug + Named {
    /// Start reporting `fd` when it is ready for `direction`.
    ///
    /// # Errors
    /// if the backend can not track `fd`.
    fn register(&mut self, fd: RawFd, direction: Direction) -> Result<()>;

    /// Stop reporting `fd` for `direction`. Unknown registrations are ignored.
    ///
    /// # Errors
    /// if the OS rejects the change.
    fn unregister(&mut self, fd: RawFd, direction: Direction) -> Result<()>;

    /// Block up to `timeout` (`None` blocks indefinitely) and return the ready pairs in
    /// report order. A still-ready fd is reported again on every call.
    ///
    /// # Errors
    /// if waiting fails for a reason other than a signal interruption.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Direction)>>;
}

/// The backend variants a hub can be built with.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BackendKind {
    /// `select(2)`
    Select,
    /// `poll(2)`
    Poll,
    /// `epoll(7)`, Linux and Android only
    Epoll,
    /// `kqueue(2)`, Apple platforms and the BSDs only
    Kqueue,
    /// a host supplied event loop
    External,
}

/// The env var used to pick a backend when the config leaves it open.
pub const BACKEND_ENV: &str = "GREENHUB_BACKEND";

impl BackendKind {
    /// Returns `true` if this backend can be built on the current platform.
    #[must_use]
    pub fn is_supported(self) -> bool {
        match self {
            BackendKind::Select | BackendKind::Poll | BackendKind::External => true,
            BackendKind::Epoll => cfg!(any(target_os = "linux", target_os = "android")),
            BackendKind::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "tvos",
                target_os = "watchos",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd",
                target_os = "netbsd"
            )),
        }
    }

    /// The best OS backend of the current platform.
    #[must_use]
    pub fn best() -> Self {
        [BackendKind::Epoll, BackendKind::Kqueue]
            .into_iter()
            .find(|kind| kind.is_supported())
            .unwrap_or(BackendKind::Poll)
    }

    /// Every OS backend the current platform supports, best first.
    #[must_use]
    pub fn available() -> Vec<Self> {
        [
            BackendKind::Epoll,
            BackendKind::Kqueue,
            BackendKind::Poll,
            BackendKind::Select,
        ]
        .into_iter()
        .filter(|kind| kind.is_supported())
        .collect()
    }

    /// Read [`BACKEND_ENV`].
    ///
    /// # Errors
    /// if the variable names an unknown or unsupported backend.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(BACKEND_ENV) {
            Ok(name) if !name.trim().is_empty() => name.parse().map(Some),
            _ => Ok(None),
        }
    }

    /// Fails fast when this backend is unavailable.
    ///
    /// # Errors
    /// if this backend is not supported on the current platform.
    pub fn check(self) -> Result<Self> {
        if self.is_supported() {
            Ok(self)
        } else {
            Err(HubError::UnsupportedBackend(format!(
                "{self} is not available on {}",
                std::env::consts::OS
            )))
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::Select => "select",
            BackendKind::Poll => "poll",
            BackendKind::Epoll => "epoll",
            BackendKind::Kqueue => "kqueue",
            BackendKind::External => "external",
        })
    }
}

impl FromStr for BackendKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "select" | "selects" => Ok(BackendKind::Select),
            "poll" => Ok(BackendKind::Poll),
            "epoll" | "epolls" => Ok(BackendKind::Epoll),
            "kqueue" => Ok(BackendKind::Kqueue),
            "external" | "external-adapter" => Ok(BackendKind::External),
            other => Err(HubError::UnsupportedBackend(format!(
                "unknown backend {other:?}"
            ))),
        }
    }
}

/// The closed set of backends, selected once when the hub is built.
#[derive(Debug)]
pub enum Backend {
    #[allow(missing_docs)]
    Select(select::SelectBackend),
    #[allow(missing_docs)]
    Poll(poll::PollBackend),
    #[allow(missing_docs)]
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(epoll::EpollBackend),
    #[allow(missing_docs)]
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "tvos",
        target_os = "watchos",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    Kqueue(kqueue::KqueueBackend),
    #[allow(missing_docs)]
    External(external::ExternalLoopAdapter),
}

macro_rules! dispatch {
    ($self:expr, $backend:ident => $body:expr) => {
        match $self {
            Backend::Select($backend) => $body,
            Backend::Poll($backend) => $body,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll($backend) => $body,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "tvos",
                target_os = "watchos",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            Backend::Kqueue($backend) => $body,
            Backend::External($backend) => $body,
        }
    };
}

impl Backend {
    /// Build an OS backend.
    ///
    /// # Errors
    /// `UnsupportedBackend` if `kind` is unavailable here or is the external adapter,
    /// which needs a host loop, see [`Backend::with_host_loop`].
    pub fn new(kind: BackendKind, event_capacity: usize) -> Result<Self> {
        match kind.check()? {
            BackendKind::Select => Ok(Backend::Select(select::SelectBackend::default())),
            BackendKind::Poll => Ok(Backend::Poll(poll::PollBackend::default())),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            BackendKind::Epoll => Ok(Backend::Epoll(epoll::EpollBackend::new(event_capacity)?)),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "tvos",
                target_os = "watchos",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            BackendKind::Kqueue => Ok(Backend::Kqueue(kqueue::KqueueBackend::new(
                event_capacity,
            )?)),
            BackendKind::External => Err(HubError::UnsupportedBackend(String::from(
                "the external adapter needs a host loop",
            ))),
            #[allow(unreachable_patterns)]
            other => Err(HubError::UnsupportedBackend(other.to_string())),
        }
    }

    /// Wrap a host event loop.
    pub fn with_host_loop(host: impl external::ExternalLoop + 'static) -> Self {
        Backend::External(external::ExternalLoopAdapter::new(host))
    }

    /// Which variant this is.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Select(_) => BackendKind::Select,
            Backend::Poll(_) => BackendKind::Poll,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Backend::Epoll(_) => BackendKind::Epoll,
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "tvos",
                target_os = "watchos",
                target_os = "freebsd",
                target_os = "dragonfly",
                target_os = "openbsd",
                target_os = "netbsd"
            ))]
            Backend::Kqueue(_) => BackendKind::Kqueue,
            Backend::External(_) => BackendKind::External,
        }
    }
}

impl Named for Backend {
    fn get_name(&self) -> &str {
        dispatch!(self, backend => backend.get_name())
    }
}

impl Multiplexer for Backend {
    fn register(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        dispatch!(self, backend => backend.register(fd, direction))
    }

    fn unregister(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        dispatch!(self, backend => backend.unregister(fd, direction))
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Direction)>> {
        dispatch!(self, backend => backend.wait(timeout))
    }
}

/// Call `f` with what is left of `timeout`, again and again while it is interrupted by
/// a signal.
pub(crate) fn retry_interrupted<T>(
    timeout: Option<Duration>,
    mut f: impl FnMut(Option<Duration>) -> std::io::Result<T>,
) -> std::io::Result<T> {
    let deadline = timeout.map(greenhub_timer::get_timeout_time);
    let mut left = timeout;
    loop {
        match f(left) {
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                left = deadline
                    .map(|deadline| Duration::from_nanos(deadline.saturating_sub(greenhub_timer::now())));
            }
            result => return result,
        }
    }
}

/// `timeout` in whole milliseconds, rounded up so a sub-millisecond wait does not spin.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    timeout.map_or(-1, |timeout| {
        let millis = timeout.as_nanos().div_ceil(1_000_000);
        libc::c_int::try_from(millis).unwrap_or(libc::c_int::MAX)
    })
}

/// Returns `true` for errors meaning the fd is not known to the OS any more.
pub(crate) fn is_stale(error: &std::io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EBADF | libc::ENOENT)
    )
}

/// Returns `true` if `fd` is not an open descriptor.
pub(crate) fn is_bad_fd(fd: RawFd) -> bool {
    let failed = unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1;
    failed && std::io::Error::last_os_error().raw_os_error() == Some(libc::EBADF)
}

/// The fds among `fds` that are no longer open, found with one non-blocking `poll(2)`.
///
/// Closing an fd silently drops it from an epoll or kqueue set, so those backends ask
/// here before blocking.
pub(crate) fn closed_fds(fds: impl IntoIterator<Item = RawFd>) -> std::io::Result<Vec<RawFd>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .into_iter()
        .map(|fd| libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        })
        .collect();
    if pollfds.is_empty() {
        return Ok(Vec::new());
    }
    let nfds = libc::nfds_t::try_from(pollfds.len()).unwrap_or(libc::nfds_t::MAX);
    let n = retry_interrupted(Some(Duration::ZERO), |_| {
        let n = unsafe { libc::poll(pollfds.as_mut_ptr(), nfds, 0) };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n)
    })?;
    if n == 0 {
        return Ok(Vec::new());
    }
    Ok(pollfds
        .iter()
        .filter(|pollfd| pollfd.revents & libc::POLLNVAL != 0)
        .map(|pollfd| pollfd.fd)
        .collect())
}
