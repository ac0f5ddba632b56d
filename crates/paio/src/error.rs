//! Watcher error types.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Submission or wait after the watcher was closed.
    WatcherClosed,
    /// Write or full-read submitted with a zero-length buffer.
    EmptyBuffer,
    /// The handle has no underlying file descriptor to operate on.
    Unsupported,
    /// The request aged out of the timeout heap before completing.
    Deadline,
    /// Zero-byte read with no OS error: the peer closed cleanly.
    Eof,
    /// OS error with errno, reported verbatim from the failing syscall.
    Os(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WatcherClosed => write!(f, "watcher closed"),
            Self::EmptyBuffer => write!(f, "empty buffer"),
            Self::Unsupported => write!(f, "unsupported handle"),
            Self::Deadline => write!(f, "deadline exceeded"),
            Self::Eof => write!(f, "end of stream"),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Capture the calling thread's current errno.
    pub(crate) fn last_os() -> Self {
        Self::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", Error::WatcherClosed), "watcher closed");
        assert_eq!(format!("{}", Error::Deadline), "deadline exceeded");
        assert_eq!(format!("{}", Error::Os(libc::EPIPE)), format!("OS error: errno {}", libc::EPIPE));
    }

    #[test]
    fn test_error_eq() {
        assert_eq!(Error::Os(11), Error::Os(11));
        assert_ne!(Error::Eof, Error::Deadline);
    }
}
