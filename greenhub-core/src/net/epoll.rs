use crate::common::Named;
use crate::error::Result;
use crate::net::{
    closed_fds, is_stale, retry_interrupted, timeout_millis, Direction, Multiplexer,
};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[allow(clippy::cast_sign_loss)]
const READ_EVENTS: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
#[allow(clippy::cast_sign_loss)]
const WRITE_EVENTS: u32 = libc::EPOLLOUT as u32;
#[allow(clippy::cast_sign_loss)]
const ERROR_EVENTS: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Level-triggered `epoll(7)` backend.
#[derive(Debug)]
pub struct EpollBackend {
    epfd: RawFd,
    interests: HashMap<RawFd, u32>,
    events: Vec<libc::epoll_event>,
}

fn mask(direction: Direction) -> u32 {
    match direction {
        Direction::Read => READ_EVENTS,
        Direction::Write => WRITE_EVENTS,
    }
}

impl EpollBackend {
    /// Create an epoll instance reporting up to `capacity` fds per wait at first.
    ///
    /// # Errors
    /// if `epoll_create1` fails.
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(EpollBackend {
            epfd,
            interests: HashMap::new(),
            events: Vec::with_capacity(capacity.max(1)),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> std::io::Result<()> {
        #[allow(clippy::cast_sign_loss)]
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait_once(&mut self, timeout: Option<Duration>) -> std::io::Result<usize> {
        let capacity = libc::c_int::try_from(self.events.capacity()).unwrap_or(libc::c_int::MAX);
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                capacity,
                timeout_millis(timeout),
            )
        };
        let n = usize::try_from(n).map_err(|_| std::io::Error::last_os_error())?;
        unsafe { self.events.set_len(n) };
        Ok(n)
    }
}

impl EpollBackend {
    /// Forget the registered fds that were closed and report them in every direction
    /// they were registered for.
    fn evict_closed(&mut self) -> std::io::Result<Vec<(RawFd, Direction)>> {
        let mut ready = Vec::new();
        for fd in closed_fds(self.interests.keys().copied())? {
            let wanted = self.interests.remove(&fd).unwrap_or(0);
            if wanted & READ_EVENTS != 0 {
                ready.push((fd, Direction::Read));
            }
            if wanted & WRITE_EVENTS != 0 {
                ready.push((fd, Direction::Write));
            }
        }
        Ok(ready)
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        _ = unsafe { libc::close(self.epfd) };
    }
}

impl Named for EpollBackend {
    fn get_name(&self) -> &str {
        "epoll"
    }
}

impl Multiplexer for EpollBackend {
    fn register(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        let old = self.interests.get(&fd).copied().unwrap_or(0);
        let new = old | mask(direction);
        if new == old {
            return Ok(());
        }
        let result = if old == 0 {
            self.ctl(libc::EPOLL_CTL_ADD, fd, new).or_else(|e| {
                if e.raw_os_error() == Some(libc::EEXIST) {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, new)
                } else {
                    Err(e)
                }
            })
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, new).or_else(|e| {
                // the fd was closed and reused since we added it
                if e.raw_os_error() == Some(libc::ENOENT) {
                    self.ctl(libc::EPOLL_CTL_ADD, fd, new)
                } else {
                    Err(e)
                }
            })
        };
        result?;
        _ = self.interests.insert(fd, new);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        let Some(old) = self.interests.get(&fd).copied() else {
            return Ok(());
        };
        let new = old & !mask(direction);
        if new == old {
            return Ok(());
        }
        let result = if new == 0 {
            _ = self.interests.remove(&fd);
            self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
        } else {
            _ = self.interests.insert(fd, new);
            self.ctl(libc::EPOLL_CTL_MOD, fd, new)
        };
        match result {
            Err(e) if is_stale(&e) => {
                _ = self.interests.remove(&fd);
                Ok(())
            }
            result => Ok(result?),
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Direction)>> {
        if timeout != Some(Duration::ZERO) {
            let closed = self.evict_closed()?;
            if !closed.is_empty() {
                return Ok(closed);
            }
        }
        let n = retry_interrupted(timeout, |left| self.wait_once(left))?;
        let mut ready = Vec::with_capacity(n);
        for event in &self.events {
            let bits = event.events;
            #[allow(clippy::cast_possible_truncation)]
            let fd = event.u64 as RawFd;
            let wanted = self.interests.get(&fd).copied().unwrap_or(0);
            let error = bits & ERROR_EVENTS != 0;
            if wanted & READ_EVENTS != 0 && (error || bits & READ_EVENTS != 0) {
                ready.push((fd, Direction::Read));
            }
            if wanted & WRITE_EVENTS != 0 && (error || bits & WRITE_EVENTS != 0) {
                ready.push((fd, Direction::Write));
            }
        }
        if n == self.events.capacity() {
            self.events.reserve(n);
        }
        Ok(ready)
    }
}
