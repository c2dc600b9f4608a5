//! Monitor store and worker.
//!
//! The monitor is the user-visible record of every transaction's progress.
//! Each sub-transaction's state only ever moves forward (the ratchet), which
//! makes updates idempotent under at-least-once delivery; a transaction's
//! displayed state is the least advanced of its sub-records until all are
//! terminal.

pub mod error;
pub mod models;
pub mod postgres;
pub mod store;
pub mod worker;

pub use error::{MonitorError, MonitorResult};
pub use models::rollup_state;
pub use postgres::PostgresMonitor;
pub use store::{MonitorStore, SqliteMonitor};
pub use worker::MonitorProcessor;

use nearline_core::config::DbConfig;
use std::sync::Arc;

/// Create a monitor store from configuration.
pub async fn from_config(config: &DbConfig) -> MonitorResult<Arc<dyn MonitorStore>> {
    match config {
        DbConfig::Sqlite { path } => {
            let store = SqliteMonitor::new(path).await?;
            Ok(Arc::new(store) as Arc<dyn MonitorStore>)
        }
        DbConfig::Postgres {
            url,
            max_connections,
        } => {
            tracing::info!("connecting monitor to PostgreSQL");
            let store = PostgresMonitor::from_url(url, *max_connections).await?;
            Ok(Arc::new(store) as Arc<dyn MonitorStore>)
        }
    }
}
