//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("tape error: {0}")]
    Tape(String),

    #[error("unknown prepare id: {0}")]
    UnknownPrepareId(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Whether retrying later could succeed. Missing objects and bad
    /// configuration are permanent; transport and service trouble is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Io(_) | StorageError::S3(_) | StorageError::Tape(_)
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
