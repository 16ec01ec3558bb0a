use crate::net::Direction;
use std::os::unix::io::RawFd;

/// A type for hub results.
pub type Result<T> = std::result::Result<T, HubError>;

/// Errors surfaced by the hub and its primitives.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Another fiber already waits on this `(fd, direction)`.
    #[error("fd {fd} already has a {direction} waiter")]
    AlreadyWaiting {
        /// the contended descriptor
        fd: RawFd,
        /// the contended direction
        direction: Direction,
    },
    /// The requested multiplexer is not available on this platform.
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),
    /// The descriptor is outside what the backend can track.
    #[error("fd {fd} exceeds the backend limit of {limit}")]
    CapacityExceeded {
        /// the rejected descriptor
        fd: RawFd,
        /// exclusive upper bound accepted by the backend
        limit: usize,
    },
    /// The fiber was killed; delivered at its next resume point.
    #[error("fiber cancelled")]
    Cancelled,
    /// The descriptor was torn down while a fiber waited on it.
    #[error("fd {0} closed while waiting")]
    Closed(RawFd),
    /// A wait with timeout elapsed.
    #[error("timed out")]
    TimedOut,
    /// The fiber body panicked.
    #[error("fiber panicked: {0}")]
    Panicked(String),
    /// The failure sink decided an unjoined failure is fatal.
    #[error("unhandled failure in {origin}: {message}")]
    Unhandled {
        /// fiber or timer name
        origin: String,
        /// rendered failure
        message: String,
    },
    /// A suspending primitive was called outside any fiber.
    #[error("not running inside a fiber")]
    NotInFiber,
    /// The hub loop was re-entered from inside itself.
    #[error("hub {0} is already running")]
    AlreadyRunning(String),
    /// A fiber tried to join itself.
    #[error("fiber would wait for itself")]
    WouldDeadlock,
    /// The hub behind a handle is gone.
    #[error("hub is gone")]
    HubGone,
    /// Error from the operating system.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Returns `true` for the cooperative cancellation signal.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HubError::Cancelled)
    }
}

impl From<HubError> for std::io::Error {
    fn from(error: HubError) -> Self {
        use std::io::ErrorKind;
        match error {
            HubError::Io(e) => e,
            HubError::TimedOut => std::io::Error::new(ErrorKind::TimedOut, error),
            HubError::UnsupportedBackend(_) => std::io::Error::new(ErrorKind::Unsupported, error),
            HubError::Closed(_) => std::io::Error::new(ErrorKind::BrokenPipe, error),
            HubError::Cancelled => std::io::Error::new(ErrorKind::Interrupted, error),
            HubError::AlreadyWaiting { .. } | HubError::AlreadyRunning(_) => {
                std::io::Error::new(ErrorKind::AlreadyExists, error)
            }
            _ => std::io::Error::new(ErrorKind::Other, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn display() {
        let error = HubError::AlreadyWaiting {
            fd: 3,
            direction: Direction::Read,
        };
        assert_eq!("fd 3 already has a read waiter", error.to_string());
        assert_eq!(
            "fd 5000 exceeds the backend limit of 1024",
            HubError::CapacityExceeded {
                fd: 5000,
                limit: 1024
            }
            .to_string()
        );
    }

    #[test]
    fn into_io_error() {
        let error: std::io::Error = HubError::TimedOut.into();
        assert_eq!(ErrorKind::TimedOut, error.kind());
        let error: std::io::Error =
            HubError::Io(std::io::Error::from(ErrorKind::WouldBlock)).into();
        assert_eq!(ErrorKind::WouldBlock, error.kind());
        assert!(HubError::Cancelled.is_cancelled());
        assert!(!HubError::TimedOut.is_cancelled());
    }
}
