use crate::error::HubError;
use crate::fiber::constants::{FiberState, WakeCause};
use crate::fiber::FiberId;
use std::fmt::Debug;

/// Observes fiber lifecycle events, all methods default to doing nothing.
///
/// Listeners are called on the hub's thread and must not add listeners themselves.
pub trait Listener: Debug {
    /// A fiber was spawned.
    fn on_spawn(&self, _fiber: FiberId, _name: &str) {}

    /// A fiber is about to be resumed.
    fn on_resume(&self, _fiber: FiberId, _name: &str, _cause: WakeCause) {}

    /// A fiber switched back to the hub.
    fn on_suspend(&self, _fiber: FiberId, _name: &str, _state: FiberState) {}

    /// A fiber is dead.
    fn on_dead(&self, _fiber: FiberId, _name: &str, _failure: Option<&HubError>) {}
}

/// What the hub does after an unjoined failure was reported.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FailurePolicy {
    /// keep running
    Continue,
    /// stop the hub and surface [`HubError::Unhandled`] from `run`
    Abort,
}

/// Receives failures nobody joined: errors and panics of detached fibers and panics of
/// timer callbacks. Cancellations never reach it.
pub trait FailureSink {
    /// Handle a failure raised by `origin`, a fiber or timer name.
    fn on_failure(&self, origin: &str, error: &HubError) -> FailurePolicy;
}

impl<F: Fn(&str, &HubError) -> FailurePolicy> FailureSink for F {
    fn on_failure(&self, origin: &str, error: &HubError) -> FailurePolicy {
        self(origin, error)
    }
}

/// The default sink: log and carry on.
#[derive(Debug, Copy, Clone, Default)]
pub struct LogSink;

impl FailureSink for LogSink {
    fn on_failure(&self, origin: &str, error: &HubError) -> FailurePolicy {
        crate::error!("{origin} failed: {error}");
        FailurePolicy::Continue
    }
}
