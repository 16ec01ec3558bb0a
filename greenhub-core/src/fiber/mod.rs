use crate::common::Named;
use crate::error::{HubError, Result};
use crate::fiber::constants::{FiberState, WakeCause};
use crate::fiber::suspender::{FiberCoroutine, Suspender};
use crate::hub::{HubHandle, HubInner};
use crate::net::Direction;
use greenhub_timer::TimerId;
use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Display, Formatter};
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

/// Constants.
pub mod constants;

pub(crate) mod suspender;

/// Identifies a fiber within its hub.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn new(id: u64) -> Self {
        FiberId(id)
    }
}

impl Display for FiberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// The hub's record of one fiber.
pub(crate) struct Fiber {
    pub(crate) id: FiberId,
    name: String,
    pub(crate) spawner: Option<FiberId>,
    pub(crate) state: Cell<FiberState>,
    pub(crate) cause: Cell<Option<WakeCause>>,
    pub(crate) started: Cell<bool>,
    pub(crate) cancel: Cell<bool>,
    pub(crate) permit: Cell<bool>,
    pub(crate) detached: Cell<bool>,
    pub(crate) timer: Cell<Option<TimerId>>,
    pub(crate) waiting: Cell<Option<(RawFd, Direction)>>,
    pub(crate) joining: Cell<Option<FiberId>>,
    pub(crate) joiners: RefCell<Vec<FiberId>>,
    pub(crate) failure: RefCell<Option<HubError>>,
    pub(crate) suspender: Cell<Option<Suspender>>,
    pub(crate) coroutine: Cell<Option<FiberCoroutine>>,
}

impl Debug for Fiber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("spawner", &self.spawner)
            .field("state", &self.state.get())
            .field("cause", &self.cause.get())
            .field("cancel", &self.cancel.get())
            .field("timer", &self.timer.get())
            .field("waiting", &self.waiting.get())
            .finish_non_exhaustive()
    }
}

impl Named for Fiber {
    fn get_name(&self) -> &str {
        &self.name
    }
}

impl Fiber {
    pub(crate) fn new(id: FiberId, name: String, spawner: Option<FiberId>) -> Self {
        Fiber {
            id,
            name,
            spawner,
            state: Cell::new(FiberState::New),
            cause: Cell::new(None),
            started: Cell::new(false),
            cancel: Cell::new(false),
            permit: Cell::new(false),
            detached: Cell::new(false),
            timer: Cell::new(None),
            waiting: Cell::new(None),
            joining: Cell::new(None),
            joiners: RefCell::new(Vec::new()),
            failure: RefCell::new(None),
            suspender: Cell::new(None),
            coroutine: Cell::new(None),
        }
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.state.get() == FiberState::Dead
    }

    /// The pending cancellation, consumed.
    pub(crate) fn check_cancel(&self) -> Result<()> {
        if self.cancel.replace(false) {
            return Err(HubError::Cancelled);
        }
        Ok(())
    }
}

/// The owning handle of a spawned fiber, used to join or kill it.
///
/// Dropping it without joining detaches the fiber: its failure, if any, then goes to
/// the hub's failure sink instead.
pub struct FiberHandle<T> {
    fiber: Rc<Fiber>,
    slot: Rc<RefCell<Option<T>>>,
    hub: Weak<HubInner>,
    joined: bool,
}

impl<T> Debug for FiberHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberHandle")
            .field("fiber", &self.fiber)
            .field("joined", &self.joined)
            .finish_non_exhaustive()
    }
}

impl<T> FiberHandle<T> {
    pub(crate) fn new(fiber: Rc<Fiber>, slot: Rc<RefCell<Option<T>>>, hub: Weak<HubInner>) -> Self {
        FiberHandle {
            fiber,
            slot,
            hub,
            joined: false,
        }
    }

    /// The fiber's id.
    #[must_use]
    pub fn id(&self) -> FiberId {
        self.fiber.id
    }

    /// The fiber's current state.
    #[must_use]
    pub fn state(&self) -> FiberState {
        self.fiber.state.get()
    }

    /// Why the fiber was last resumed.
    #[must_use]
    pub fn last_cause(&self) -> Option<WakeCause> {
        self.fiber.cause.get()
    }

    /// The fiber that spawned this one, if spawned from a fiber.
    #[must_use]
    pub fn spawner(&self) -> Option<FiberId> {
        self.fiber.spawner
    }

    /// Returns `true` once the fiber finished, failed or was cancelled.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.fiber.is_dead()
    }

    fn hub(&self) -> Option<HubHandle> {
        self.hub.upgrade().map(HubHandle::from_inner)
    }

    /// Cancel the fiber, see [`HubHandle::kill`].
    pub fn kill(&self) {
        if let Some(hub) = self.hub() {
            hub.kill(self.fiber.id);
        }
    }

    /// Wait for the fiber to finish and take its outcome.
    ///
    /// Inside another fiber this suspends the caller; outside any fiber it drives the
    /// hub until the target is dead.
    ///
    /// # Errors
    /// the fiber's own error, [`HubError::Panicked`] if it panicked,
    /// [`HubError::Cancelled`] if either side was killed, or
    /// [`HubError::WouldDeadlock`] when a fiber joins itself.
    pub fn join(mut self) -> Result<T> {
        if !self.fiber.is_dead() {
            let hub = self.hub().ok_or(HubError::HubGone)?;
            hub.join_fiber(&self.fiber)?;
        }
        self.joined = true;
        if let Some(failure) = self.fiber.failure.borrow_mut().take() {
            return Err(failure);
        }
        self.slot.borrow_mut().take().ok_or(HubError::Cancelled)
    }

    /// Give up the handle on purpose.
    pub fn detach(self) {}
}

impl<T> Named for FiberHandle<T> {
    fn get_name(&self) -> &str {
        self.fiber.get_name()
    }
}

impl<T> Drop for FiberHandle<T> {
    fn drop(&mut self) {
        if self.joined {
            return;
        }
        self.fiber.detached.set(true);
        if !self.fiber.is_dead() {
            return;
        }
        let failure = self.fiber.failure.borrow_mut().take();
        if let (Some(failure), Some(hub)) = (failure, self.hub()) {
            hub.report_failure(self.fiber.get_name(), &failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_display() {
        assert_eq!("fiber#7", FiberId::new(7).to_string());
        assert!(FiberId::new(1) < FiberId::new(2));
    }

    #[test]
    fn cancel_consumed_once() {
        let fiber = Fiber::new(FiberId::new(1), String::from("f"), None);
        assert!(fiber.check_cancel().is_ok());
        fiber.cancel.set(true);
        assert!(fiber.check_cancel().unwrap_err().is_cancelled());
        assert!(fiber.check_cancel().is_ok());
        assert_eq!(FiberState::New, fiber.state.get());
    }
}
