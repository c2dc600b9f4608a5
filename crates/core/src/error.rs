//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid routing key: {0}")]
    InvalidRoutingKey(String),

    #[error("malformed message envelope: {0}")]
    MalformedMessage(String),

    #[error("duplicate storage location of type {0}")]
    DuplicateLocation(crate::details::StorageType),

    #[error("unknown state: {0}")]
    UnknownState(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedMessage(e.to_string())
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
