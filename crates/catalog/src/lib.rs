//! Catalog store and worker.
//!
//! The catalog is the authoritative record of what the system holds and
//! where: holdings, transactions, files, per-tier locations and tape
//! aggregations. Every mutation flows through the single-consumer catalog
//! queue; readers may query over RPC.

pub mod auth;
pub mod error;
pub mod models;
pub mod postgres;
pub mod store;
pub mod worker;

pub use auth::{Authenticator, PermissiveAuthenticator, Role};
pub use error::{CatalogError, CatalogResult};
pub use postgres::PostgresCatalog;
pub use store::{CatalogStore, FileQuery, SqliteCatalog};
pub use worker::CatalogProcessor;

use nearline_core::config::DbConfig;
use std::sync::Arc;

/// Create a catalog store from configuration.
pub async fn from_config(config: &DbConfig) -> CatalogResult<Arc<dyn CatalogStore>> {
    match config {
        DbConfig::Sqlite { path } => {
            let store = SqliteCatalog::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn CatalogStore>)
        }
        DbConfig::Postgres {
            url,
            max_connections,
        } => {
            tracing::info!("connecting catalog to PostgreSQL");
            let store = PostgresCatalog::from_url(url, *max_connections).await?;
            Ok(Arc::new(store) as Arc<dyn CatalogStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_config_sqlite() {
        let temp = tempfile::tempdir().unwrap();
        let config = DbConfig::sqlite(temp.path().join("catalog.db"));
        let store = from_config(&config).await.unwrap();
        store.health_check().await.unwrap();
    }
}
