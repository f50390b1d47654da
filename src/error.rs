//! Error types for sbxfs

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the overlay and its container lifecycle
#[derive(Error, Debug)]
pub enum Error {
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Reserved sidecar name: {0}")]
    ReservedName(PathBuf),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    #[error("Container encode failed for {path}: {reason}")]
    Encode { path: PathBuf, reason: String },

    #[error("Corrupt container {path}: {reason}")]
    CorruptContainer { path: PathBuf, reason: String },

    #[error("Container repair failed for {path}: {reason}")]
    Repair { path: PathBuf, reason: String },

    #[error("Container decode failed for {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    #[error("Unrecoverable corruption in {path}: {failed_to_repair} of {failed_to_process} blocks could not be repaired")]
    UnrecoverableCorruption {
        path: PathBuf,
        failed_to_process: u64,
        failed_to_repair: u64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// errno handed back to the kernel for this error
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::ReservedName(_) => libc::EPERM,
            Error::InvalidHandle(_) => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::InvalidConfig(_) | Error::Config(_) => libc::EINVAL,
            Error::Encode { .. }
            | Error::CorruptContainer { .. }
            | Error::Repair { .. }
            | Error::Decode { .. }
            | Error::UnrecoverableCorruption { .. }
            | Error::Internal(_) => libc::EIO,
        }
    }

    /// Classify an OS error raised while touching `path`
    pub fn from_io(path: impl Into<PathBuf>, e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.into()),
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.into()),
            _ => Error::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound(PathBuf::from("a")).errno(), libc::ENOENT);
        assert_eq!(
            Error::PermissionDenied(PathBuf::from("a")).errno(),
            libc::EACCES
        );
        let unrecoverable = Error::UnrecoverableCorruption {
            path: PathBuf::from("a"),
            failed_to_process: 4,
            failed_to_repair: 1,
        };
        assert_eq!(unrecoverable.errno(), libc::EIO);
        assert_eq!(
            Error::Io(std::io::Error::from_raw_os_error(libc::ENOTEMPTY)).errno(),
            libc::ENOTEMPTY
        );
    }

    #[test]
    fn test_from_io_classifies_kind() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(Error::from_io("x", missing), Error::NotFound(_)));

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            Error::from_io("x", denied),
            Error::PermissionDenied(_)
        ));
    }
}
