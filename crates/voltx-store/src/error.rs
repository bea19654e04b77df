//! Object store error types

use thiserror::Error;

/// Object store error
#[derive(Error, Debug)]
pub enum StoreError {
    /// Dataset not found
    #[error("dataset not found: {0}")]
    NotFound(String),

    /// Dataset already exists
    #[error("dataset already exists: {0}")]
    AlreadyExists(String),

    /// Access mode not permitted
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Dataset is owned by another session
    #[error("dataset busy: {0}")]
    Busy(String),

    /// Stored data failed verification
    #[error("checksum mismatch in object {object} at offset {offset}")]
    ChecksumMismatch { object: u64, offset: u64 },

    /// Not enough space to commit
    #[error("insufficient space: required {required} bytes, available {available} bytes")]
    NoSpace { required: u64, available: u64 },

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not supported in the current state
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Session was closed
    #[error("session closed: {0}")]
    Closed(String),

    /// Transaction could not be committed
    #[error("transaction aborted: {0}")]
    Aborted(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the error reports corrupted data
    #[must_use]
    pub const fn is_checksum(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
