//! The error taxonomy surfaced by engine operations.
//!
//! Every asynchronous operation delivers exactly one of these to its handler;
//! synchronous operations return them through [`Result`]. Transient would-block
//! conditions are handled inside the engine and never reach callers.

use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds reported by socket, timer and context operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation was cancelled, either by `close` or an explicit cancel.
    #[error("operation aborted")]
    Aborted,

    /// A stream receive observed a clean shutdown by the peer.
    #[error("end of stream")]
    Eof,

    /// The peer hard-closed the connection or sent a reset.
    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("host or network unreachable")]
    Unreachable,

    #[error("address already in use")]
    AddrInUse,

    #[error("address not available")]
    AddrNotAvailable,

    /// The socket was not open, or its descriptor is no longer valid.
    #[error("bad socket descriptor")]
    BadDescriptor,

    /// `open` on a socket that already holds a descriptor.
    #[error("socket already open")]
    AlreadyOpen,

    #[error("socket already connected")]
    AlreadyConnected,

    #[error("socket not connected")]
    NotConnected,

    #[error("invalid argument")]
    InvalidArgument,

    /// Any other OS failure, carrying the original error.
    #[error("system error: {0}")]
    Sys(#[source] io::Error),
}

impl Error {
    /// Maps a raw errno to an error kind.
    pub(crate) fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECANCELED => Error::Aborted,
            libc::ECONNRESET | libc::EPIPE => Error::ConnectionReset,
            libc::ECONNREFUSED => Error::ConnectionRefused,
            libc::ECONNABORTED => Error::ConnectionAborted,
            libc::ENETUNREACH | libc::EHOSTUNREACH => Error::Unreachable,
            libc::EADDRINUSE => Error::AddrInUse,
            libc::EADDRNOTAVAIL => Error::AddrNotAvailable,
            libc::EBADF | libc::ENOTSOCK => Error::BadDescriptor,
            libc::EISCONN => Error::AlreadyConnected,
            libc::ENOTCONN => Error::NotConnected,
            libc::EINVAL => Error::InvalidArgument,
            _ => Error::Sys(io::Error::from_raw_os_error(errno)),
        }
    }

    /// Maps an [`io::Error`], preserving the raw errno when present.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => Error::from_errno(errno),
            None => match err.kind() {
                io::ErrorKind::ConnectionReset => Error::ConnectionReset,
                io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
                io::ErrorKind::ConnectionAborted => Error::ConnectionAborted,
                io::ErrorKind::AddrInUse => Error::AddrInUse,
                io::ErrorKind::AddrNotAvailable => Error::AddrNotAvailable,
                io::ErrorKind::NotConnected => Error::NotConnected,
                io::ErrorKind::InvalidInput => Error::InvalidArgument,
                io::ErrorKind::UnexpectedEof => Error::Eof,
                _ => Error::Sys(err),
            },
        }
    }

    /// The error for the calling thread's most recent syscall.
    pub(crate) fn last_os() -> Self {
        Error::from_io(io::Error::last_os_error())
    }

    /// True for cancellation results.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }

    /// True for the clean end-of-stream condition.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::from_io(err)
    }
}

/// The calling thread's current errno.
pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Transient try-again conditions that the engine retries internally.
pub(crate) fn is_would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_the_taxonomy() {
        assert!(matches!(
            Error::from_errno(libc::ECONNRESET),
            Error::ConnectionReset
        ));
        assert!(matches!(Error::from_errno(libc::EBADF), Error::BadDescriptor));
        assert!(matches!(Error::from_errno(libc::ECANCELED), Error::Aborted));
        assert!(matches!(Error::from_errno(libc::EISCONN), Error::AlreadyConnected));
        assert!(matches!(Error::from_errno(libc::ENOENT), Error::Sys(_)));
    }

    #[test]
    fn would_block_is_internal_only() {
        assert!(is_would_block(libc::EAGAIN));
        assert!(!is_would_block(libc::EINTR));
    }
}
