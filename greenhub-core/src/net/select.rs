use crate::common::Named;
use crate::error::{HubError, Result};
use crate::net::{is_bad_fd, retry_interrupted, Direction, Multiplexer};
use std::collections::BTreeSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// The exclusive upper bound of descriptors `select(2)` can watch.
#[must_use]
pub fn select_limit() -> usize {
    usize::try_from(libc::FD_SETSIZE).unwrap_or(1024)
}

/// Portable backend on `select(2)`, limited to descriptors below [`select_limit`].
#[derive(Debug, Default)]
pub struct SelectBackend {
    readers: BTreeSet<RawFd>,
    writers: BTreeSet<RawFd>,
}

/// `timeout` as a `timeval`, rounded up to the next microsecond so a near deadline does
/// not turn into a busy poll.
fn timeval(timeout: Duration) -> libc::timeval {
    let micros = timeout.as_nanos().div_ceil(1_000);
    let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
    tv.tv_sec = libc::time_t::try_from(micros / 1_000_000).unwrap_or(libc::time_t::MAX);
    tv.tv_usec = libc::suseconds_t::try_from(micros % 1_000_000).unwrap_or(0);
    tv
}

impl SelectBackend {
    fn set_of(&mut self, direction: Direction) -> &mut BTreeSet<RawFd> {
        match direction {
            Direction::Read => &mut self.readers,
            Direction::Write => &mut self.writers,
        }
    }

    fn watched(&self) -> BTreeSet<RawFd> {
        self.readers.union(&self.writers).copied().collect()
    }

    fn wants(&self, fd: RawFd, read: bool, write: bool) -> Vec<(RawFd, Direction)> {
        let mut ready = Vec::new();
        if read && self.readers.contains(&fd) {
            ready.push((fd, Direction::Read));
        }
        if write && self.writers.contains(&fd) {
            ready.push((fd, Direction::Write));
        }
        ready
    }

    fn select_once(&self, timeout: Option<Duration>) -> std::io::Result<Vec<(RawFd, Direction)>> {
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut error_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut error_set);
            for fd in &self.readers {
                libc::FD_SET(*fd, &mut read_set);
                libc::FD_SET(*fd, &mut error_set);
            }
            for fd in &self.writers {
                libc::FD_SET(*fd, &mut write_set);
                libc::FD_SET(*fd, &mut error_set);
            }
        }
        let watched = self.watched();
        let nfds = watched.last().map_or(0, |fd| fd + 1);
        let mut tv = timeout.map(timeval);
        let tvp = tv
            .as_mut()
            .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);
        let n = unsafe {
            libc::select(
                nfds,
                &mut read_set,
                &mut write_set,
                &mut error_set,
                tvp,
            )
        };
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut ready = Vec::new();
        if n == 0 {
            return Ok(ready);
        }
        for fd in watched {
            let (read, write, error) = unsafe {
                (
                    libc::FD_ISSET(fd, &read_set),
                    libc::FD_ISSET(fd, &write_set),
                    libc::FD_ISSET(fd, &error_set),
                )
            };
            ready.extend(self.wants(fd, read || error, write || error));
        }
        Ok(ready)
    }
}

impl Named for SelectBackend {
    fn get_name(&self) -> &str {
        "select"
    }
}

impl Multiplexer for SelectBackend {
    fn register(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        let limit = select_limit();
        if usize::try_from(fd).map_or(true, |fd| fd >= limit) {
            return Err(HubError::CapacityExceeded { fd, limit });
        }
        _ = self.set_of(direction).insert(fd);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        _ = self.set_of(direction).remove(&fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Direction)>> {
        match retry_interrupted(timeout, |left| self.select_once(left)) {
            Ok(ready) => Ok(ready),
            // a watched fd was closed behind our back, report it so its waiter can see
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => Ok(self
                .watched()
                .into_iter()
                .filter(|fd| is_bad_fd(*fd))
                .flat_map(|fd| self.wants(fd, true, true))
                .collect()),
            Err(e) => Err(e.into()),
        }
    }
}
