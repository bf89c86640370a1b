//! Error types for tierio
//!
//! This module defines the common error type used throughout the engine.
//! Errors are classified as transient (the backend could not be reached and
//! a later attempt may succeed) or fatal for the operation that raised them.

use thiserror::Error;

/// Common result type for tierio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for tierio
#[derive(Debug, Error)]
pub enum Error {
    // Backend errors
    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("backend not ready: {0}")]
    NotReady(String),

    #[error("backend not found: {0}")]
    BackendNotFound(u16),

    #[error("backend limit reached: at most {max} backends")]
    BackendLimit { max: usize },

    #[error("capacity exceeded: required {required} sectors, available {available} sectors")]
    CapacityExceeded { required: u64, available: u64 },

    // Header / index errors
    #[error("incompatible header: {0}")]
    HeaderIncompatible(String),

    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("sector out of range: {sector} (logical sectors: {count})")]
    OutOfRange { sector: u64, count: u64 },

    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // RPC errors
    #[error("request timeout")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Internal errors
    #[error("engine is shut down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a backend unreachable error
    pub fn unreachable(backend: impl Into<String>) -> Self {
        Self::BackendUnreachable(backend.into())
    }

    /// Check if the error is transient: the backend could not be reached,
    /// but the data behind it is not known to be damaged.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnreachable(_) | Self::NotReady(_) | Self::Timeout
        )
    }

    /// Check if a request that failed with this error may be re-issued
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Map the error onto an errno value for a block front end.
    ///
    /// Unreachable backends and timeouts become `EIO` on the affected
    /// range; everything else gets an operation-specific code.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::BackendUnreachable(_)
            | Self::NotReady(_)
            | Self::Timeout
            | Self::DiskIo(_)
            | Self::Storage(_)
            | Self::Protocol(_) => libc::EIO,
            Self::BackendNotFound(_) => libc::ENODEV,
            Self::BackendLimit { .. } | Self::CapacityExceeded { .. } => libc::ENOSPC,
            Self::OutOfRange { .. } | Self::InvalidArgument(_) | Self::Configuration(_) => {
                libc::EINVAL
            }
            Self::HeaderIncompatible(_) => libc::EPROTO,
            Self::IndexCorruption(_) => libc::EUCLEAN,
            Self::Shutdown => libc::ESHUTDOWN,
            Self::Internal(_) => libc::EFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_transient() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::unreachable("plugin-a").is_transient());
        assert!(!Error::HeaderIncompatible("v9".into()).is_transient());
        assert!(
            !Error::CapacityExceeded {
                required: 10,
                available: 1
            }
            .is_transient()
        );
    }

    #[test]
    fn test_error_errno() {
        assert_eq!(Error::Timeout.errno(), libc::EIO);
        assert_eq!(Error::unreachable("x").errno(), libc::EIO);
        assert_eq!(Error::BackendLimit { max: 16 }.errno(), libc::ENOSPC);
        assert_eq!(Error::invalid_argument("bad").errno(), libc::EINVAL);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Error = io.into();
        assert!(matches!(err, Error::DiskIo(_)));
    }
}
