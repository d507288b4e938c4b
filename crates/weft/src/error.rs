// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for weft operations.
//!
//! Variants follow the conventional POSIX meanings the wire components were
//! designed around; [`Error::errno`] recovers the raw number for embedders
//! that still speak `errno`.

use std::io;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by weft operations.
///
/// # Example
///
/// ```rust,no_run
/// use weft::{Error, Gateway};
/// # fn demo(gateway: &Gateway) {
/// match gateway.try_recv() {
///     Err(Error::WouldBlock) => { /* nothing pending */ }
///     Err(e) => eprintln!("recv failed: {}", e),
///     Ok((service, parts)) => println!("{}: {} frames", service, parts.len()),
/// }
/// # }
/// ```
#[derive(Debug)]
pub enum Error {
    /// Malformed arguments: empty service name, oversized topic, bad mode,
    /// bad pattern, invalid endpoint string.
    InvalidArgument(&'static str),
    /// Handle used after its component was destroyed.
    StaleHandle,
    /// Feature or transport not compiled in, or an operation the component
    /// does not honor.
    Unsupported,
    /// No provider currently advertised for the named service, or the
    /// routing id is unknown on the router.
    HostUnreachable,
    /// Non-blocking operation would block.
    WouldBlock,
    /// A bounded wait expired.
    TimedOut,
    /// Topic already exists.
    AlreadyExists,
    /// Topic does not exist.
    NotFound,
    /// Peer endpoint refused the connection (e.g. unbound inproc name).
    ConnectionRefused,
    /// The socket or context was shut down while the caller was blocked.
    Terminated,
    /// Transport-level I/O failure.
    Io(io::Error),
}

impl Error {
    /// Conventional POSIX error number for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::StaleHandle => libc::EFAULT,
            Error::Unsupported => libc::ENOTSUP,
            Error::HostUnreachable => libc::EHOSTUNREACH,
            Error::WouldBlock => libc::EAGAIN,
            Error::TimedOut => libc::ETIMEDOUT,
            Error::AlreadyExists => libc::EEXIST,
            Error::NotFound => libc::ENOENT,
            Error::ConnectionRefused => libc::ECONNREFUSED,
            Error::Terminated => libc::EINTR,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True for the errors the gateway treats as retryable at send time.
    ///
    /// `WouldBlock` retries after a short sleep; `HostUnreachable` retries
    /// after a pool refresh. Everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::HostUnreachable)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(what) => write!(f, "Invalid argument: {}", what),
            Error::StaleHandle => write!(f, "Stale handle"),
            Error::Unsupported => write!(f, "Unsupported operation"),
            Error::HostUnreachable => write!(f, "No reachable provider"),
            Error::WouldBlock => write!(f, "Operation would block"),
            Error::TimedOut => write!(f, "Timed out"),
            Error::AlreadyExists => write!(f, "Already exists"),
            Error::NotFound => write!(f, "Not found"),
            Error::ConnectionRefused => write!(f, "Connection refused"),
            Error::Terminated => write!(f, "Terminated"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => Error::WouldBlock,
            io::ErrorKind::TimedOut => Error::TimedOut,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            _ => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::InvalidArgument("x").errno(), libc::EINVAL);
        assert_eq!(Error::HostUnreachable.errno(), libc::EHOSTUNREACH);
        assert_eq!(Error::WouldBlock.errno(), libc::EAGAIN);
        assert_eq!(Error::TimedOut.errno(), libc::ETIMEDOUT);
        assert_eq!(Error::AlreadyExists.errno(), libc::EEXIST);
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
    }

    #[test]
    fn test_retryable_set() {
        assert!(Error::WouldBlock.is_retryable());
        assert!(Error::HostUnreachable.is_retryable());
        assert!(!Error::TimedOut.is_retryable());
        assert!(!Error::InvalidArgument("x").is_retryable());
        assert!(!Error::Unsupported.is_retryable());
    }

    #[test]
    fn test_from_io_wouldblock() {
        let e: Error = io::Error::new(io::ErrorKind::WouldBlock, "wb").into();
        assert!(matches!(e, Error::WouldBlock));
    }

    #[test]
    fn test_display_contains_detail() {
        let e = Error::InvalidArgument("empty service name");
        assert!(e.to_string().contains("empty service name"));
    }
}
