//! Error types for the fabric.

use thiserror::Error;

/// Fabric error type.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue already declared: {0}")]
    QueueExists(String),

    #[error("invalid binding pattern: {0}")]
    InvalidBinding(String),

    #[error("rpc call timed out after {0:?}")]
    RpcTimeout(std::time::Duration),

    #[error("rpc request carried no reply-to queue")]
    NoReplyTo,

    #[error(transparent)]
    Envelope(#[from] nearline_core::Error),
}

/// Result type alias for fabric operations.
pub type FabricResult<T> = std::result::Result<T, FabricError>;
