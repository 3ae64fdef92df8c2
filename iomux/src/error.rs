//! Portable error codes.
//!
//! Kernel results (errno values on Linux, NTSTATUS values on Windows) are translated into an
//! [`Error`] at the boundary of the backend that produced them. The type is `Copy` so that it can
//! be stored in operation state and read back by listeners without any ownership juggling.
use std::fmt;
use std::io;

/// Errors produced by multiplexers, handles and operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The submission ring, completion budget or slot pool is exhausted. Retry after the next pump.
    TooManyConcurrentAsyncOperations,
    /// The handle is not attached to a multiplexer.
    HandleIsNotMultiplexable,
    /// The multiplexer has no implementation for this kind of handle.
    NoHandleRelation { handle: &'static str },
    /// The operation was cancelled before it could complete.
    OperationCanceled,
    /// A deadline attached to the operation expired.
    TimedOut,
    InvalidArgument,
    NotSupported,
    /// A native error code: an errno value on unix, a Win32 error code on Windows.
    Os(i32),
    /// An error reported by the standard library without an OS error code.
    Io(io::ErrorKind),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Translate a native error code, folding cancellation into [`Error::OperationCanceled`].
    pub fn from_raw_os_error(code: i32) -> Error {
        #[cfg(unix)]
        {
            if code == libc::ECANCELED {
                return Error::OperationCanceled;
            }
            if code == libc::ETIME || code == libc::ETIMEDOUT {
                return Error::TimedOut;
            }
        }
        #[cfg(windows)]
        {
            if code == winapi::shared::winerror::ERROR_OPERATION_ABORTED as i32 {
                return Error::OperationCanceled;
            }
            if code == winapi::shared::winerror::ERROR_TIMEOUT as i32 {
                return Error::TimedOut;
            }
        }
        Error::Os(code)
    }

    /// Capture the calling thread's last OS error.
    pub fn last_os_error() -> Error {
        Error::from(io::Error::last_os_error())
    }

    /// Translate a negative kernel result such as the `res` field of a completion queue entry.
    #[cfg(unix)]
    pub(crate) fn from_kernel_result(result: i32) -> Error {
        debug_assert!(result < 0);
        Error::from_raw_os_error(-result)
    }

    /// Translate a failed NTSTATUS through its Win32 error code.
    #[cfg(windows)]
    pub(crate) fn from_ntstatus(status: winapi::shared::ntdef::NTSTATUS) -> Error {
        use winapi::shared::ntstatus::{STATUS_CANCELLED, STATUS_TIMEOUT};
        match status {
            STATUS_CANCELLED => Error::OperationCanceled,
            STATUS_TIMEOUT => Error::TimedOut,
            status => {
                let code = unsafe { crate::sys::windows::ntapi::RtlNtStatusToDosError(status) };
                Error::from_raw_os_error(code as i32)
            }
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::OperationCanceled)
    }

    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Error::TooManyConcurrentAsyncOperations)
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match *self {
            Error::Os(code) => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TooManyConcurrentAsyncOperations => {
                write!(f, "too many concurrent asynchronous operations")
            }
            Error::HandleIsNotMultiplexable => write!(f, "handle is not attached to a multiplexer"),
            Error::NoHandleRelation { handle } => {
                write!(f, "the multiplexer does not support handles of type {}", handle)
            }
            Error::OperationCanceled => write!(f, "operation canceled"),
            Error::TimedOut => write!(f, "operation timed out"),
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::NotSupported => write!(f, "operation not supported"),
            Error::Os(code) => write!(f, "{}", io::Error::from_raw_os_error(*code)),
            Error::Io(kind) => write!(f, "{:?}", kind),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(code) => Error::from_raw_os_error(code),
            None => Error::Io(err.kind()),
        }
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Error {
        Error::from_raw_os_error(errno as i32)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Os(code) => io::Error::from_raw_os_error(code),
            Error::Io(kind) => io::Error::from(kind),
            Error::TooManyConcurrentAsyncOperations => io::Error::new(io::ErrorKind::WouldBlock, err),
            Error::OperationCanceled => io::Error::new(io::ErrorKind::Interrupted, err),
            Error::TimedOut => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::InvalidArgument => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::HandleIsNotMultiplexable | Error::NoHandleRelation { .. } | Error::NotSupported => {
                io::Error::new(io::ErrorKind::Other, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_cancellation_is_distinct() {
        let err = Error::from_kernel_result(-libc::ECANCELED);
        assert!(err.is_cancellation());
        assert_eq!(None, err.raw_os_error());

        let err = Error::from_kernel_result(-libc::EBADF);
        assert!(!err.is_cancellation());
        assert_eq!(Some(libc::EBADF), err.raw_os_error());
    }

    #[cfg(unix)]
    #[test]
    fn test_io_error_round_trip() {
        let err: Error = io::Error::from_raw_os_error(libc::ENOENT).into();
        assert_eq!(Error::Os(libc::ENOENT), err);
        let back: io::Error = err.into();
        assert_eq!(Some(libc::ENOENT), back.raw_os_error());

        let err: Error = nix::errno::Errno::EAGAIN.into();
        assert_eq!(Error::Os(libc::EAGAIN), err);
    }

    #[test]
    fn test_exhaustion_maps_to_would_block() {
        let err = Error::TooManyConcurrentAsyncOperations;
        assert!(err.is_resource_exhaustion());
        let io_err: io::Error = err.into();
        assert_eq!(io::ErrorKind::WouldBlock, io_err.kind());
    }
}
