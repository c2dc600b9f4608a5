//! Monitor error types.

use thiserror::Error;

/// Monitor operation errors.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Domain(#[from] nearline_core::Error),
}

impl MonitorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MonitorError::Db(_))
    }
}

/// Result type for monitor operations.
pub type MonitorResult<T> = std::result::Result<T, MonitorError>;
