use crate::common::page_size;
use crate::error::Result;
use crate::net::BackendKind;
use std::time::Duration;

/// Default fiber stack size, enough for formatting a panic and a backtrace.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default upper bound of one backend wait.
pub const DEFAULT_POLL_CEILING: Duration = Duration::from_secs(60);

/// Default number of readiness events fetched per wait.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Settings of one hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    name: Option<String>,
    backend: Option<BackendKind>,
    stack_size: usize,
    poll_ceiling: Option<Duration>,
    event_capacity: usize,
}

impl Config {
    /// The hub name, a fresh uuid when unset.
    #[must_use]
    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The explicitly requested backend, if any.
    #[must_use]
    pub fn get_backend(&self) -> Option<BackendKind> {
        self.backend
    }

    /// The stack size of each fiber, never smaller than a page.
    #[must_use]
    pub fn get_stack_size(&self) -> usize {
        self.stack_size.max(page_size())
    }

    /// The longest a single backend wait may block, `None` for no bound.
    #[must_use]
    pub fn get_poll_ceiling(&self) -> Option<Duration> {
        self.poll_ceiling
    }

    /// How many events the epoll and kqueue backends fetch per wait at first.
    #[must_use]
    pub fn get_event_capacity(&self) -> usize {
        self.event_capacity
    }

    #[allow(missing_docs)]
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    #[allow(missing_docs)]
    pub fn set_backend(&mut self, backend: BackendKind) -> &mut Self {
        self.backend = Some(backend);
        self
    }

    #[allow(missing_docs)]
    pub fn set_stack_size(&mut self, stack_size: usize) -> &mut Self {
        self.stack_size = stack_size;
        self
    }

    #[allow(missing_docs)]
    pub fn set_poll_ceiling(&mut self, poll_ceiling: Option<Duration>) -> &mut Self {
        self.poll_ceiling = poll_ceiling;
        self
    }

    #[allow(missing_docs)]
    pub fn set_event_capacity(&mut self, event_capacity: usize) -> &mut Self {
        self.event_capacity = event_capacity.max(1);
        self
    }

    /// The backend to build: the explicit choice, else `GREENHUB_BACKEND`, else the
    /// best one of this platform.
    ///
    /// # Errors
    /// if the chosen backend is unknown or unavailable here.
    pub fn resolve_backend(&self) -> Result<BackendKind> {
        match self.backend {
            Some(kind) => kind.check(),
            None => match BackendKind::from_env()? {
                Some(kind) => kind.check(),
                None => Ok(BackendKind::best()),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: None,
            backend: None,
            stack_size: DEFAULT_STACK_SIZE,
            poll_ceiling: Some(DEFAULT_POLL_CEILING),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
