use crate::common::Named;
use crate::error::Result;
use crate::net::{closed_fds, is_stale, retry_interrupted, Direction, Multiplexer};
use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// `kqueue(2)` backend with one read and one write filter per fd.
#[derive(Debug)]
pub struct KqueueBackend {
    kq: RawFd,
    readers: HashSet<RawFd>,
    writers: HashSet<RawFd>,
    events: Vec<libc::kevent>,
}

impl KqueueBackend {
    /// Create a kqueue reporting up to `capacity` events per wait at first.
    ///
    /// # Errors
    /// if `kqueue` fails.
    pub fn new(capacity: usize) -> std::io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
            let e = std::io::Error::last_os_error();
            _ = unsafe { libc::close(kq) };
            return Err(e);
        }
        Ok(KqueueBackend {
            kq,
            readers: HashSet::new(),
            writers: HashSet::new(),
            events: Vec::with_capacity(capacity.max(1)),
        })
    }

    fn set_of(&mut self, direction: Direction) -> &mut HashSet<RawFd> {
        match direction {
            Direction::Read => &mut self.readers,
            Direction::Write => &mut self.writers,
        }
    }

    fn change(&self, fd: RawFd, direction: Direction, flags: u16) -> std::io::Result<()> {
        let mut event: libc::kevent = unsafe { std::mem::zeroed() };
        event.ident = fd as _;
        let filter = match direction {
            Direction::Read => libc::EVFILT_READ,
            Direction::Write => libc::EVFILT_WRITE,
        };
        event.filter = filter as _;
        event.flags = flags as _;
        let n = unsafe {
            libc::kevent(
                self.kq,
                &event,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait_once(&mut self, timeout: Option<Duration>) -> std::io::Result<usize> {
        let ts = timeout.map(|timeout| {
            let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
            ts.tv_sec = libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX);
            ts.tv_nsec = timeout.subsec_nanos() as _;
            ts
        });
        let tsp = ts
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
        let capacity = libc::c_int::try_from(self.events.capacity()).unwrap_or(libc::c_int::MAX);
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                self.events.as_mut_ptr(),
                capacity as _,
                tsp,
            )
        };
        let n = usize::try_from(n).map_err(|_| std::io::Error::last_os_error())?;
        unsafe { self.events.set_len(n) };
        Ok(n)
    }
}

impl KqueueBackend {
    /// Forget the registered fds that were closed, their filters went with them, and
    /// report them in every direction they were registered for.
    fn evict_closed(&mut self) -> std::io::Result<Vec<(RawFd, Direction)>> {
        let watched: HashSet<RawFd> = self.readers.union(&self.writers).copied().collect();
        let mut ready = Vec::new();
        for fd in closed_fds(watched)? {
            if self.readers.remove(&fd) {
                ready.push((fd, Direction::Read));
            }
            if self.writers.remove(&fd) {
                ready.push((fd, Direction::Write));
            }
        }
        Ok(ready)
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        _ = unsafe { libc::close(self.kq) };
    }
}

impl Named for KqueueBackend {
    fn get_name(&self) -> &str {
        "kqueue"
    }
}

impl Multiplexer for KqueueBackend {
    fn register(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        if self.set_of(direction).contains(&fd) {
            return Ok(());
        }
        self.change(fd, direction, libc::EV_ADD as u16)?;
        _ = self.set_of(direction).insert(fd);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        if !self.set_of(direction).remove(&fd) {
            return Ok(());
        }
        match self.change(fd, direction, libc::EV_DELETE as u16) {
            // closing an fd drops its filters
            Err(e) if is_stale(&e) => Ok(()),
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
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let fd = event.ident as RawFd;
            let direction = if event.filter == libc::EVFILT_READ as _ {
                Direction::Read
            } else if event.filter == libc::EVFILT_WRITE as _ {
                Direction::Write
            } else {
                continue;
            };
            let wanted = match direction {
                Direction::Read => self.readers.contains(&fd),
                Direction::Write => self.writers.contains(&fd),
            };
            if wanted {
                ready.push((fd, direction));
            }
        }
        if n == self.events.capacity() {
            self.events.reserve(n);
        }
        Ok(ready)
    }
}
