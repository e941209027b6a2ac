//! Common error types for mirrorfs.

use thiserror::Error;

/// Top-level error type for mirrorfs operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Virtual path is malformed or escapes the mirror root.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Virtual path, or one of its components, is over the length limit.
    #[error("Path too long: {0}")]
    PathTooLong(String),

    /// Backing file absent on a read-class operation.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Container header is malformed or truncated.
    #[error("Format error: {0}")]
    Format(String),

    /// Integrity tag mismatch: tampered ciphertext or wrong key.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Underlying storage read, write or rename failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Negative or overflowing offset.
    #[error("Offset out of range: {0}")]
    OutOfRange(String),

    /// Requested file size cannot be staged.
    #[error("File too large: {0}")]
    FileTooLarge(String),

    /// Handle id is unknown or already released.
    #[error("Bad handle: {0}")]
    BadHandle(u64),

    /// Invalid input provided (configuration, passphrase).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Cryptographic primitive failed for a reason other than integrity.
    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl Error {
    /// Map an I/O error from the backing store, turning a missing file into
    /// `NotFound` for the given virtual path.
    pub fn from_backing_io(err: std::io::Error, path: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(path.to_string())
        } else {
            Error::Io(err)
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_missing_backing_file_maps_to_not_found() {
        let err = Error::from_backing_io(io::Error::from(io::ErrorKind::NotFound), "/a.txt");
        assert!(matches!(err, Error::NotFound(p) if p == "/a.txt"));
    }

    #[test]
    fn test_other_io_errors_stay_io() {
        let err = Error::from_backing_io(
            io::Error::from(io::ErrorKind::PermissionDenied),
            "/a.txt",
        );
        assert!(matches!(err, Error::Io(_)));
    }
}
