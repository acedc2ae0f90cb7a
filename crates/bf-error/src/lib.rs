#![forbid(unsafe_code)]
//! Error types for Broken Fuse.
//!
//! Defines `BfError` and a `Result<T>` alias used throughout the workspace,
//! with errno mappings for FUSE response codes. Injected faults carry their
//! configured errno verbatim; everything else maps to the closest POSIX code.

use thiserror::Error;

/// Unified error type for all Broken Fuse operations.
#[derive(Debug, Error)]
pub enum BfError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fault-injection effect fired with its configured errno.
    #[error("injected fault: errno {0}")]
    Injected(i32),

    #[error("operation interrupted")]
    Interrupted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no such attribute: {0}")]
    NoData(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("no space left in subtree")]
    NoSpace,

    #[error("subtree quota exhausted")]
    QuotaExceeded,

    #[error("operation not supported")]
    NotSupported,

    /// Node table desync or lock-order breach. Unreachable in correct
    /// operation; the daemon unmounts and exits with code 10.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl BfError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Injected(errno) => *errno,
            Self::Interrupted => libc::EINTR,
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::NoData(_) => libc::ENODATA,
            Self::NotFound(_) => libc::ENOENT,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NoSpace => libc::ENOSPC,
            Self::QuotaExceeded => libc::EDQUOT,
            Self::NotSupported => libc::ENOTSUP,
            Self::Internal(_) => libc::EIO,
        }
    }

    /// Whether this error must abort the daemon (exit code 10).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Result alias using `BfError`.
pub type Result<T> = std::result::Result<T, BfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(BfError::Injected(libc::EIO).to_errno(), libc::EIO);
        assert_eq!(BfError::Injected(7).to_errno(), 7);
        assert_eq!(BfError::Interrupted.to_errno(), libc::EINTR);
        assert_eq!(
            BfError::InvalidConfig("x".to_owned()).to_errno(),
            libc::EINVAL
        );
        assert_eq!(BfError::NoData("bf.effect.delay".to_owned()).to_errno(), libc::ENODATA);
        assert_eq!(BfError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(BfError::QuotaExceeded.to_errno(), libc::EDQUOT);
        assert_eq!(BfError::NotFound("f".to_owned()).to_errno(), libc::ENOENT);
    }

    #[test]
    fn io_error_preserves_raw_errno() {
        let err = BfError::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn only_internal_is_fatal() {
        assert!(BfError::Internal("desync".to_owned()).is_fatal());
        assert!(!BfError::NoSpace.is_fatal());
        assert!(!BfError::Injected(5).is_fatal());
    }
}
