use crate::fiber::FiberId;
use crate::net::Direction;
use std::fmt::{Debug, Display, Formatter};
use std::os::unix::io::RawFd;

/// Enums used to describe fiber state
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FiberState {
    /// The fiber is created but not yet scheduled, e.g. a delayed spawn.
    New,
    /// The fiber sits in the ready queue.
    Runnable,
    /// The fiber is running.
    Running,
    /// The fiber waits for fd readiness.
    SuspendedIo,
    /// The fiber sleeps.
    SuspendedTimer,
    /// The fiber waits for another fiber to finish.
    SuspendedJoin,
    /// The fiber is parked until unparked.
    SuspendedPark,
    /// The fiber finished, failed or was cancelled.
    Dead,
}

impl FiberState {
    /// Returns `true` for the suspended states.
    #[must_use]
    pub fn is_suspended(self) -> bool {
        matches!(
            self,
            FiberState::SuspendedIo
                | FiberState::SuspendedTimer
                | FiberState::SuspendedJoin
                | FiberState::SuspendedPark
        )
    }
}

impl Display for FiberState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Why a fiber was resumed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WakeCause {
    /// First run after spawn.
    Spawned,
    /// It yielded and got its turn again.
    Yielded,
    /// The fd became ready.
    Io(RawFd, Direction),
    /// Its sleep elapsed.
    Timer,
    /// The fiber it joined is dead.
    Joined(FiberId),
    /// Someone unparked it.
    Unparked,
    /// It was killed.
    Cancelled,
    /// Its fd was torn down.
    Closed(RawFd),
    /// Its wait timed out.
    TimedOut,
}

impl Display for WakeCause {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}
