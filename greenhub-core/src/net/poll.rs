use crate::common::Named;
use crate::error::{HubError, Result};
use crate::net::{retry_interrupted, timeout_millis, Direction, Multiplexer};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLPRI;
const WRITE_EVENTS: libc::c_short = libc::POLLOUT;
const ERROR_EVENTS: libc::c_short = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

/// Portable backend on `poll(2)`, with no descriptor ceiling.
#[derive(Debug, Default)]
pub struct PollBackend {
    interests: BTreeMap<RawFd, libc::c_short>,
    fds: Vec<libc::pollfd>,
}

fn mask(direction: Direction) -> libc::c_short {
    match direction {
        Direction::Read => READ_EVENTS,
        Direction::Write => WRITE_EVENTS,
    }
}

impl PollBackend {
    fn poll_once(&mut self, timeout: Option<Duration>) -> std::io::Result<usize> {
        let nfds = libc::nfds_t::try_from(self.fds.len())
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        let n = unsafe { libc::poll(self.fds.as_mut_ptr(), nfds, timeout_millis(timeout)) };
        usize::try_from(n).map_err(|_| std::io::Error::last_os_error())
    }
}

impl Named for PollBackend {
    fn get_name(&self) -> &str {
        "poll"
    }
}

impl Multiplexer for PollBackend {
    fn register(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        if fd < 0 {
            return Err(HubError::Io(std::io::Error::from_raw_os_error(libc::EBADF)));
        }
        *self.interests.entry(fd).or_insert(0) |= mask(direction);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd, direction: Direction) -> Result<()> {
        if let Some(events) = self.interests.get_mut(&fd) {
            *events &= !mask(direction);
            if *events == 0 {
                _ = self.interests.remove(&fd);
            }
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, Direction)>> {
        self.fds.clear();
        self.fds.extend(self.interests.iter().map(|(fd, events)| libc::pollfd {
            fd: *fd,
            events: *events,
            revents: 0,
        }));
        let n = retry_interrupted(timeout, |left| self.poll_once(left))?;
        let mut ready = Vec::with_capacity(n);
        if n == 0 {
            return Ok(ready);
        }
        for pollfd in &self.fds {
            let revents = pollfd.revents;
            if revents == 0 {
                continue;
            }
            let error = revents & ERROR_EVENTS != 0;
            if pollfd.events & READ_EVENTS != 0 && (error || revents & READ_EVENTS != 0) {
                ready.push((pollfd.fd, Direction::Read));
            }
            if pollfd.events & WRITE_EVENTS != 0 && (error || revents & WRITE_EVENTS != 0) {
                ready.push((pollfd.fd, Direction::Write));
            }
        }
        Ok(ready)
    }
}
