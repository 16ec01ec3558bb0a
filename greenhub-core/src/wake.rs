use crate::error::{HubError, Result};
use crate::fiber::FiberId;
use crate::hub::HubHandle;
use crossbeam_deque::{Injector, Steal};
use std::fmt::{Debug, Formatter};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A self-pipe that makes the hub's backend report readable.
#[derive(Debug)]
pub(crate) struct Notifier {
    reader: RawFd,
    writer: RawFd,
    notified: AtomicBool,
}

fn set_nonblocking_cloexec(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

impl Notifier {
    pub(crate) fn new() -> std::io::Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let notifier = Notifier {
            reader: fds[0],
            writer: fds[1],
            notified: AtomicBool::new(false),
        };
        set_nonblocking_cloexec(notifier.reader)?;
        set_nonblocking_cloexec(notifier.writer)?;
        Ok(notifier)
    }

    pub(crate) fn reader(&self) -> RawFd {
        self.reader
    }

    /// Make the reader readable, once per drain.
    pub(crate) fn notify(&self) -> std::io::Result<()> {
        if self.notified.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        loop {
            let n = unsafe { libc::write(self.writer, [1u8].as_ptr().cast(), 1) };
            if n >= 0 {
                return Ok(());
            }
            let e = std::io::Error::last_os_error();
            match e.kind() {
                std::io::ErrorKind::Interrupted => continue,
                // a full pipe is readable already
                std::io::ErrorKind::WouldBlock => return Ok(()),
                _ => {
                    self.notified.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        }
    }

    /// Consume every pending byte, then re-arm [`Notifier::notify`].
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.reader, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                continue;
            }
            if n < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
        self.notified.store(false, Ordering::Release);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        unsafe {
            _ = libc::close(self.reader);
            _ = libc::close(self.writer);
        }
    }
}

/// Work handed to the hub from another thread.
pub(crate) enum WakeRequest {
    Unpark(FiberId),
    Call(Box<dyn FnOnce(&HubHandle) + Send>),
    Stop,
}

impl Debug for WakeRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            WakeRequest::Unpark(id) => f.debug_tuple("Unpark").field(id).finish(),
            WakeRequest::Call(_) => f.write_str("Call"),
            WakeRequest::Stop => f.write_str("Stop"),
        }
    }
}

/// The only part of a hub that is shared across threads.
#[derive(Debug)]
pub(crate) struct WakeChannel {
    queue: Injector<WakeRequest>,
    notifier: Notifier,
    closed: AtomicBool,
}

impl WakeChannel {
    pub(crate) fn new() -> std::io::Result<Self> {
        Ok(WakeChannel {
            queue: Injector::new(),
            notifier: Notifier::new()?,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub(crate) fn push(&self, request: WakeRequest) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubError::HubGone);
        }
        self.queue.push(request);
        self.notifier.notify()?;
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<WakeRequest> {
        loop {
            match self.queue.steal() {
                Steal::Success(request) => return Some(request),
                Steal::Empty => return None,
                Steal::Retry => {}
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.pop().is_some() {}
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A `Send + Sync` handle for waking a hub from other threads.
///
/// Every method only enqueues; the work happens on the hub's thread during its next
/// turn, and fails with [`HubError::HubGone`] once the hub has been dropped.
#[derive(Clone)]
pub struct RemoteHandle {
    name: Arc<str>,
    channel: Arc<WakeChannel>,
}

impl Debug for RemoteHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("hub", &self.name)
            .field("closed", &self.channel.is_closed())
            .finish()
    }
}

impl RemoteHandle {
    pub(crate) fn new(name: &str, channel: Arc<WakeChannel>) -> Self {
        RemoteHandle {
            name: Arc::from(name),
            channel,
        }
    }

    /// The name of the hub this handle wakes.
    #[must_use]
    pub fn hub_name(&self) -> &str {
        &self.name
    }

    /// Unpark `fiber`, or leave it a permit if it is not parked yet.
    ///
    /// # Errors
    /// if the hub is gone, or the notifier can not be written.
    pub fn unpark(&self, fiber: FiberId) -> Result<()> {
        self.channel.push(WakeRequest::Unpark(fiber))
    }

    /// Run `callback` on the hub's thread.
    ///
    /// # Errors
    /// if the hub is gone, or the notifier can not be written.
    pub fn call(&self, callback: impl FnOnce(&HubHandle) + Send + 'static) -> Result<()> {
        self.channel.push(WakeRequest::Call(Box::new(callback)))
    }

    /// Ask [`HubHandle::run`](crate::hub::HubHandle::run) to return.
    ///
    /// # Errors
    /// if the hub is gone, or the notifier can not be written.
    pub fn stop(&self) -> Result<()> {
        self.channel.push(WakeRequest::Stop)
    }
}
