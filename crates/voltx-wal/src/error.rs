//! Intent log error types

use thiserror::Error;

/// Intent log error
#[derive(Error, Debug)]
pub enum WalError {
    /// I/O error on the log file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Log header is missing or foreign
    #[error("Invalid log header: {0}")]
    InvalidHeader(String),

    /// Record failed to decode or verify
    #[error("Corrupt log record: {0}")]
    Corrupt(String),

    /// The log was closed
    #[error("Log closed: {0}")]
    Closed(String),

    /// The data source could not provide or persist record data
    #[error("Log data source error: {0}")]
    Source(String),
}

/// Result type for intent log operations
pub type WalResult<T> = Result<T, WalError>;
