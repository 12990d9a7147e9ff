//! Error taxonomy
//!
//! A single error type is used across the op manager, the storage engine and
//! the flow engine. Backend-specific codes (OS errnos, serialization
//! failures) are translated into this taxonomy at the storage boundary and
//! surfaced verbatim across the API; nothing in the crate retries silently.
//!
//! Errors are `Clone` because a completed op's result is fanned out to its
//! completion context and possibly to a context callback.

use std::io;

/// Errors produced by Stratum operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument or state precondition was invalid
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The named object (op, handle, key, collection) does not exist
    #[error("not found")]
    NotFound,

    /// The object already exists and overwrite was not requested
    #[error("already exists")]
    Exists,

    /// An allocation failed or a resource pool is exhausted
    #[error("out of memory")]
    NoMem,

    /// A wait finished before the condition was met
    #[error("timed out")]
    Timeout,

    /// The object is in use and cannot be shut down or removed
    #[error("resource busy: {0}")]
    Busy(String),

    /// Lock ordering conflict; the caller may retry with backoff
    #[error("deadlock detected")]
    Deadlock,

    /// A required lock could not be taken
    #[error("lock unavailable")]
    NoLock,

    /// An I/O error from the underlying store or host filesystem
    #[error("I/O error: {0}")]
    Io(String),

    /// An offset or size fell outside the addressable range
    #[error("out of range: {0}")]
    Range(String),

    /// The op was canceled before completion
    #[error("canceled")]
    Canceled,

    /// Transient condition; the caller should retry
    #[error("try again")]
    Again,

    /// Unrecoverable engine state; the collection refuses further writes
    /// until re-opened
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Translate a raw errno value into the taxonomy
    ///
    /// Used where results come back from raw syscalls (`preadv`, `pwritev`,
    /// aio backends) rather than through `std::io`.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => Error::NotFound,
            libc::EEXIST => Error::Exists,
            libc::ENOMEM => Error::NoMem,
            libc::ETIMEDOUT => Error::Timeout,
            libc::EBUSY => Error::Busy("device or resource busy".into()),
            libc::EDEADLK => Error::Deadlock,
            libc::EAGAIN => Error::Again,
            libc::EINVAL => Error::InvalidArg("invalid argument from OS".into()),
            libc::ERANGE => Error::Range("errno ERANGE".into()),
            libc::ECANCELED => Error::Canceled,
            other => Error::Io(io::Error::from_raw_os_error(other).to_string()),
        }
    }

    /// True if the error is transient and a caller-side retry is reasonable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Again | Error::Timeout | Error::Deadlock)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound,
            io::ErrorKind::AlreadyExists => Error::Exists,
            io::ErrorKind::WouldBlock => Error::Again,
            io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::OutOfMemory => Error::NoMem,
            _ => match e.raw_os_error() {
                Some(errno) => Error::from_errno(errno),
                None => Error::Io(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_translation() {
        assert_eq!(Error::from_errno(libc::ENOENT), Error::NotFound);
        assert_eq!(Error::from_errno(libc::EEXIST), Error::Exists);
        assert_eq!(Error::from_errno(libc::EAGAIN), Error::Again);
        assert_eq!(Error::from_errno(libc::EDEADLK), Error::Deadlock);
    }

    #[test]
    fn test_io_error_translation() {
        let e = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from(e), Error::NotFound);

        let e = io::Error::from_raw_os_error(libc::ETIMEDOUT);
        assert_eq!(Error::from(e), Error::Timeout);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Again.is_retryable());
        assert!(Error::Deadlock.is_retryable());
        assert!(!Error::NotFound.is_retryable());
        assert!(!Error::Io("disk on fire".into()).is_retryable());
    }
}
