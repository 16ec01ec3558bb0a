use crate::net::external::{ExternalLoop, ReadyCallback};
use crate::net::{is_stale, Direction};
use polling::{Event, Events, PollMode, Poller};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

#[derive(Default)]
struct Watchers {
    read: Option<ReadyCallback>,
    write: Option<ReadyCallback>,
}

impl Watchers {
    fn slot(&mut self, direction: Direction) -> &mut Option<ReadyCallback> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn interest(&self, fd: RawFd) -> Event {
        #[allow(clippy::cast_sign_loss)]
        let key = fd as usize;
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// A ready-made [`ExternalLoop`] on top of `polling`, standing in for a host
/// application's own loop.
pub struct PollingHostLoop {
    poller: Poller,
    watchers: HashMap<RawFd, Watchers>,
    events: Events,
}

impl Debug for PollingHostLoop {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingHostLoop")
            .field("poller", &self.poller)
            .field("watched", &self.watchers.len())
            .finish_non_exhaustive()
    }
}

impl PollingHostLoop {
    /// Create a host loop.
    ///
    /// # Errors
    /// if the poller can not be created.
    pub fn new() -> std::io::Result<Self> {
        Ok(PollingHostLoop {
            poller: Poller::new()?,
            watchers: HashMap::new(),
            events: Events::new(),
        })
    }

    /// Wake a blocked [`ExternalLoop::run_once`] from any thread.
    ///
    /// # Errors
    /// if the poller can not be notified.
    pub fn notify(&self) -> std::io::Result<()> {
        self.poller.notify()
    }

    /// How many fds currently have a watcher.
    #[must_use]
    pub fn watched(&self) -> usize {
        self.watchers.len()
    }
}

impl ExternalLoop for PollingHostLoop {
    fn add_watcher(
        &mut self,
        fd: RawFd,
        direction: Direction,
        on_ready: ReadyCallback,
    ) -> std::io::Result<()> {
        let existed = self.watchers.contains_key(&fd);
        let watchers = self.watchers.entry(fd).or_default();
        let previous = watchers.slot(direction).replace(on_ready);
        let interest = watchers.interest(fd);
        let result = if existed {
            self.poller.modify_with_mode(
                unsafe { BorrowedFd::borrow_raw(fd) },
                interest,
                PollMode::Level,
            )
        } else {
            unsafe { self.poller.add_with_mode(fd, interest, PollMode::Level) }
        };
        if result.is_err() {
            if let Some(watchers) = self.watchers.get_mut(&fd) {
                *watchers.slot(direction) = previous;
                if !existed {
                    _ = self.watchers.remove(&fd);
                }
            }
        }
        result
    }

    fn remove_watcher(&mut self, fd: RawFd, direction: Direction) -> std::io::Result<()> {
        let Some(watchers) = self.watchers.get_mut(&fd) else {
            return Ok(());
        };
        if watchers.slot(direction).take().is_none() {
            return Ok(());
        }
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let result = if watchers.read.is_none() && watchers.write.is_none() {
            _ = self.watchers.remove(&fd);
            self.poller.delete(borrowed)
        } else {
            let interest = watchers.interest(fd);
            self.poller
                .modify_with_mode(borrowed, interest, PollMode::Level)
        };
        match result {
            Err(e) if is_stale(&e) => Ok(()),
            result => result,
        }
    }

    fn run_once(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.events.clear();
        _ = self.poller.wait(&mut self.events, timeout)?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let ready: Vec<(RawFd, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.key as RawFd, event.readable, event.writable))
            .collect();
        for (fd, readable, writable) in ready {
            let Some(watchers) = self.watchers.get_mut(&fd) else {
                continue;
            };
            if readable {
                if let Some(callback) = watchers.read.as_mut() {
                    callback();
                }
            }
            if writable {
                if let Some(callback) = watchers.write.as_mut() {
                    callback();
                }
            }
        }
        Ok(())
    }
}
