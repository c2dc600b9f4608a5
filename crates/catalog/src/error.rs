//! Catalog error types.

use thiserror::Error;

/// Catalog operation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Domain(#[from] nearline_core::Error),
}

impl CatalogError {
    /// Database trouble may clear on retry; everything else is a property of
    /// the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Db(_))
    }
}

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
