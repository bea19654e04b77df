//! Volume layer error types

use std::io;
use thiserror::Error;
use voltx_store::StoreError;
use voltx_wal::WalError;

/// Volume layer error
#[derive(Error, Debug)]
pub enum VolumeError {
    /// No volume registered under the name
    #[error("Volume not found: {0}")]
    NotFound(String),

    /// A volume is already registered under the name
    #[error("Volume already exists: {0}")]
    Exists(String),

    /// Another handle holds exclusive access
    #[error("Volume is held exclusively: {0}")]
    AlreadyExclusive(String),

    /// Conflicting open mode, or the volume is in use
    #[error("Volume is busy: {0}")]
    Busy(String),

    /// Write access to a read-only volume
    #[error("Volume is read-only: {0}")]
    ReadOnlyViolation(String),

    /// I/O on a volume that is not open
    #[error("Volume is not open: {0}")]
    Closed(String),

    /// I/O beyond the end of the volume
    #[error("Offset {offset} + length {length} exceeds volume size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    /// Failure reported by the object store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Failure reported by the intent log
    #[error("Intent log error: {0}")]
    Log(#[from] WalError),

    /// A lock could not be taken without blocking
    #[error("Interrupted while acquiring {0}")]
    Interrupted(String),

    /// Operation not applicable to the volume
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Invalid administrative argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl VolumeError {
    /// Whether the error came from the store or the log
    #[must_use]
    pub const fn is_engine(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Log(_))
    }
}

impl From<VolumeError> for io::Error {
    fn from(err: VolumeError) -> Self {
        let kind = match &err {
            VolumeError::NotFound(_) => io::ErrorKind::NotFound,
            VolumeError::Exists(_) => io::ErrorKind::AlreadyExists,
            VolumeError::AlreadyExclusive(_) | VolumeError::Busy(_) => io::ErrorKind::ResourceBusy,
            VolumeError::ReadOnlyViolation(_) => io::ErrorKind::PermissionDenied,
            VolumeError::Closed(_) => io::ErrorKind::NotConnected,
            VolumeError::OutOfRange { .. } | VolumeError::InvalidArgument(_) => {
                io::ErrorKind::InvalidInput
            }
            VolumeError::Interrupted(_) => io::ErrorKind::Interrupted,
            VolumeError::Unsupported(_) => io::ErrorKind::Unsupported,
            // Checksum failures and every other engine error are plain I/O errors.
            VolumeError::Store(_) | VolumeError::Log(_) => io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

/// Result type for volume operations
pub type VolumeResult<T> = Result<T, VolumeError>;
