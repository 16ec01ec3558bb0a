use crate::common::Named;
use crate::error::Result;
use crate::net::{closed_fds, retry_interrupted, Direction, Multiplexer};
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::fmt::{Debug, Formatter};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

/// Invoked by the host loop whenever a watched fd is ready.
pub type ReadyCallback = Box<dyn FnMut()>;

/// A host event loop the hub can run on top of.
///
/// Watchers must be level-triggered: a ready fd fires its callback on every turn
/// until it is removed.
pub trait ExternalLoop {
    /// Install `on_ready` for `(fd, direction)`, replacing any earlier one.
    ///
    /// # Errors
    /// if the host can not watch `fd`.
    fn add_watcher(
        &mut self,
        fd: RawFd,
        direction: Direction,
        on_ready: ReadyCallback,
    ) -> std::io::Result<()>;

    /// Remove the watcher of `(fd, direction)` if any.
    ///
    /// # Errors
    /// if the host rejects the removal.
    fn remove_watcher(&mut self, fd: RawFd, direction: Direction) -> std::io::Result<()>;

    /// Run one turn, blocking up to `timeout` (`None` blocks indefinitely).
    ///
    /// # Errors
    /// if the turn fails.
    fn run_once(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
}

/// Drives an [`ExternalLoop`] as the hub's backend.
pub struct ExternalLoopAdapter {
    host: Box<dyn ExternalLoop>,
    registered: HashSet<(RawFd, Direction)>,
    fired: Rc<RefCell<VecDeque<(RawFd, Direction)>>>,
}

impl Debug for ExternalLoopAdapter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalLoopAdapter")
            .field("registered", &self.registered)
            .field("fired", &self.fired.borrow().len())
            .finish_non_exhaustive()
    }
}

impl ExternalLoopAdapter {
    /// Wrap `host`.
    pub fn new(host: impl ExternalLoop + 'static) -> Self {
        ExternalLoopAdapter {
            host: Box::new(host),
            registered: HashSet::new(),
            fired: Rc::new(RefCell::new(VecDeque::new())),
        }
    }
}

impl ExternalLoopAdapter {
    /// Hosts rarely notice a watched fd being closed, so drop those watchers here and
    /// report the fds in every direction they were registered for.
    fn evict_closed(&mut self) -> std::io::Result<Vec<(RawFd, Direction)>> {
        let watched: HashSet<RawFd> = self.registered.iter().map(|(fd, _)| *fd).collect();
        let mut ready = Vec::new();
        for fd in closed_fds(watched)? {
            for direction in [Direction::Read, Direction::Write] {
                if !self.registered.remove(&(fd, direction)) {
                    continue;
                }
                if let Err(e) = self.host.remove_watcher(fd, direction) {
                    crate::warn!("failed to remove the {direction} watcher of closed fd {fd}: {e}");
                }
                ready.push((fd, direction));
            }
        }
        Ok(ready)
    }
}

impl Named for ExternalLoopAdapter {
    fn get_name(&self) -> &str {
        "external"
    }
}

impl Multiplexer for ExternalLoopAdapter {
    fn register(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        if self.registered.contains(&(fd, direction)) {
            return Ok(());
        }
        let fired = Rc::clone(&self.fired);
        self.host.add_watcher(
            fd,
            direction,
            Box::new(move || fired.borrow_mut().push_back((fd, direction))),
        )?;
        _ = self.registered.insert((fd, direction));
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        if self.registered.remove(&(fd, direction)) {
            self.host.remove_watcher(fd, direction)?;
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Direction)>> {
        let timeout = if self.fired.borrow().is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        if timeout != Some(Duration::ZERO) {
            let closed = self.evict_closed()?;
            if !closed.is_empty() {
                return Ok(closed);
            }
        }
        retry_interrupted(timeout, |left| self.host.run_once(left))?;
        let mut seen = HashSet::new();
        let ready = self
            .fired
            .borrow_mut()
            .drain(..)
            .filter(|pair| self.registered.contains(pair) && seen.insert(*pair))
            .collect();
        Ok(ready)
    }
}
