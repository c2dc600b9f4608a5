//! Monitor store trait and the SQLite implementation.

use crate::error::{MonitorError, MonitorResult};
use crate::models::{FailedFileRow, SubRecordRow, TransactionRecordRow, WarningRow};
use async_trait::async_trait;
use nearline_core::State;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// The persistent per-sub-transaction state store.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn migrate(&self) -> MonitorResult<()>;
    async fn health_check(&self) -> MonitorResult<()>;

    async fn get_transaction_record(
        &self,
        transaction_id: &str,
    ) -> MonitorResult<Option<TransactionRecordRow>>;
    async fn create_transaction_record(
        &self,
        transaction_id: &str,
        user: &str,
        group: &str,
        api_action: &str,
        job_label: Option<&str>,
    ) -> MonitorResult<TransactionRecordRow>;
    async fn list_transaction_records(
        &self,
        user: &str,
        group: &str,
    ) -> MonitorResult<Vec<TransactionRecordRow>>;

    async fn get_sub_record(&self, sub_id: &str) -> MonitorResult<Option<SubRecordRow>>;
    async fn create_sub_record(
        &self,
        transaction_record_id: i64,
        sub_id: &str,
        state: State,
    ) -> MonitorResult<SubRecordRow>;
    /// Apply the ratchet: persist `state` only if it outranks the stored
    /// one. Returns whether the row changed.
    async fn ratchet_sub_record(&self, sub_id: &str, state: State) -> MonitorResult<bool>;
    async fn set_retry_count(&self, sub_id: &str, retry_count: i64) -> MonitorResult<()>;
    async fn sub_records_of(
        &self,
        transaction_record_id: i64,
    ) -> MonitorResult<Vec<SubRecordRow>>;

    async fn create_failed_file(
        &self,
        sub_record_id: i64,
        filepath: &str,
        reason: &str,
    ) -> MonitorResult<FailedFileRow>;
    async fn get_failed_files(&self, sub_record_id: i64) -> MonitorResult<Vec<FailedFileRow>>;

    async fn create_warning(
        &self,
        transaction_record_id: i64,
        warning: &str,
    ) -> MonitorResult<WarningRow>;
    async fn get_warnings(&self, transaction_record_id: i64) -> MonitorResult<Vec<WarningRow>>;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS transaction_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id TEXT NOT NULL UNIQUE,
    user_name TEXT NOT NULL,
    group_name TEXT NOT NULL,
    api_action TEXT NOT NULL,
    job_label TEXT,
    creation_time TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trec_user ON transaction_records (user_name, group_name);

CREATE TABLE IF NOT EXISTS sub_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sub_id TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_updated TEXT NOT NULL,
    transaction_record_id INTEGER NOT NULL
        REFERENCES transaction_records (id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_srec_trec ON sub_records (transaction_record_id);

CREATE TABLE IF NOT EXISTS failed_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filepath TEXT NOT NULL,
    reason TEXT NOT NULL,
    sub_record_id INTEGER NOT NULL REFERENCES sub_records (id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_ff_srec ON failed_files (sub_record_id);

CREATE TABLE IF NOT EXISTS warnings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    warning TEXT NOT NULL,
    transaction_record_id INTEGER NOT NULL
        REFERENCES transaction_records (id) ON DELETE CASCADE
);
"#;

/// SQLite-backed monitor.
pub struct SqliteMonitor {
    pool: Pool<Sqlite>,
}

impl SqliteMonitor {
    pub async fn new(path: impl AsRef<Path>) -> MonitorResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MonitorError::Config(e.to_string()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(MonitorError::Db)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }
}

#[async_trait]
impl MonitorStore for SqliteMonitor {
    async fn migrate(&self) -> MonitorResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MonitorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_transaction_record(
        &self,
        transaction_id: &str,
    ) -> MonitorResult<Option<TransactionRecordRow>> {
        Ok(sqlx::query_as::<_, TransactionRecordRow>(
            "SELECT * FROM transaction_records WHERE transaction_id = ?",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn create_transaction_record(
        &self,
        transaction_id: &str,
        user: &str,
        group: &str,
        api_action: &str,
        job_label: Option<&str>,
    ) -> MonitorResult<TransactionRecordRow> {
        Ok(sqlx::query_as::<_, TransactionRecordRow>(
            "INSERT INTO transaction_records \
             (transaction_id, user_name, group_name, api_action, job_label, creation_time) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(transaction_id)
        .bind(user)
        .bind(group)
        .bind(api_action)
        .bind(job_label)
        .bind(OffsetDateTime::now_utc())
        .fetch_one(&self.pool)
        .await?)
    }

    async fn list_transaction_records(
        &self,
        user: &str,
        group: &str,
    ) -> MonitorResult<Vec<TransactionRecordRow>> {
        Ok(sqlx::query_as::<_, TransactionRecordRow>(
            "SELECT * FROM transaction_records \
             WHERE user_name = ? AND group_name = ? ORDER BY creation_time DESC",
        )
        .bind(user)
        .bind(group)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_sub_record(&self, sub_id: &str) -> MonitorResult<Option<SubRecordRow>> {
        Ok(
            sqlx::query_as::<_, SubRecordRow>("SELECT * FROM sub_records WHERE sub_id = ?")
                .bind(sub_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn create_sub_record(
        &self,
        transaction_record_id: i64,
        sub_id: &str,
        state: State,
    ) -> MonitorResult<SubRecordRow> {
        Ok(sqlx::query_as::<_, SubRecordRow>(
            "INSERT INTO sub_records \
             (sub_id, state, retry_count, last_updated, transaction_record_id) \
             VALUES (?, ?, 0, ?, ?) RETURNING *",
        )
        .bind(sub_id)
        .bind(state.as_str())
        .bind(OffsetDateTime::now_utc())
        .bind(transaction_record_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn ratchet_sub_record(&self, sub_id: &str, state: State) -> MonitorResult<bool> {
        // read-compare-write; safe under the single-consumer monitor queue,
        // and the guarded UPDATE keeps a concurrent writer from regressing
        // the row
        let Some(current) = self.get_sub_record(sub_id).await? else {
            return Err(MonitorError::NotFound(format!("sub record {sub_id}")));
        };
        let current_state = current.parsed_state()?;
        if !current_state.ratchet_allows(state) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE sub_records SET state = ?, last_updated = ? \
             WHERE sub_id = ? AND state = ?",
        )
        .bind(state.as_str())
        .bind(OffsetDateTime::now_utc())
        .bind(sub_id)
        .bind(current_state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_retry_count(&self, sub_id: &str, retry_count: i64) -> MonitorResult<()> {
        sqlx::query("UPDATE sub_records SET retry_count = ? WHERE sub_id = ?")
            .bind(retry_count)
            .bind(sub_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sub_records_of(
        &self,
        transaction_record_id: i64,
    ) -> MonitorResult<Vec<SubRecordRow>> {
        Ok(sqlx::query_as::<_, SubRecordRow>(
            "SELECT * FROM sub_records WHERE transaction_record_id = ? ORDER BY id",
        )
        .bind(transaction_record_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_failed_file(
        &self,
        sub_record_id: i64,
        filepath: &str,
        reason: &str,
    ) -> MonitorResult<FailedFileRow> {
        Ok(sqlx::query_as::<_, FailedFileRow>(
            "INSERT INTO failed_files (filepath, reason, sub_record_id) \
             VALUES (?, ?, ?) RETURNING *",
        )
        .bind(filepath)
        .bind(reason)
        .bind(sub_record_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_failed_files(&self, sub_record_id: i64) -> MonitorResult<Vec<FailedFileRow>> {
        Ok(sqlx::query_as::<_, FailedFileRow>(
            "SELECT * FROM failed_files WHERE sub_record_id = ? ORDER BY id",
        )
        .bind(sub_record_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_warning(
        &self,
        transaction_record_id: i64,
        warning: &str,
    ) -> MonitorResult<WarningRow> {
        Ok(sqlx::query_as::<_, WarningRow>(
            "INSERT INTO warnings (warning, transaction_record_id) VALUES (?, ?) RETURNING *",
        )
        .bind(warning)
        .bind(transaction_record_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_warnings(&self, transaction_record_id: i64) -> MonitorResult<Vec<WarningRow>> {
        Ok(sqlx::query_as::<_, WarningRow>(
            "SELECT * FROM warnings WHERE transaction_record_id = ? ORDER BY id",
        )
        .bind(transaction_record_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteMonitor) {
        let temp = tempfile::tempdir().unwrap();
        let store = SqliteMonitor::new(temp.path().join("monitor.db"))
            .await
            .unwrap();
        (temp, store)
    }

    #[tokio::test]
    async fn ratchet_never_regresses() {
        let (_t, store) = store().await;
        let trec = store
            .create_transaction_record("tx-1", "alice", "climate", "put", None)
            .await
            .unwrap();
        store
            .create_sub_record(trec.id, "sub-1", State::Routing)
            .await
            .unwrap();

        assert!(store
            .ratchet_sub_record("sub-1", State::Indexing)
            .await
            .unwrap());
        assert!(store
            .ratchet_sub_record("sub-1", State::TransferPutting)
            .await
            .unwrap());
        // an older state replayed after progress: ignored
        assert!(!store
            .ratchet_sub_record("sub-1", State::Indexing)
            .await
            .unwrap());
        // equal state: idempotent no-op
        assert!(!store
            .ratchet_sub_record("sub-1", State::TransferPutting)
            .await
            .unwrap());

        let sub = store.get_sub_record("sub-1").await.unwrap().unwrap();
        assert_eq!(sub.parsed_state().unwrap(), State::TransferPutting);
    }

    #[tokio::test]
    async fn ratchet_unknown_sub_is_not_found() {
        let (_t, store) = store().await;
        assert!(matches!(
            store.ratchet_sub_record("missing", State::Indexing).await,
            Err(MonitorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_files_attach_to_sub_records() {
        let (_t, store) = store().await;
        let trec = store
            .create_transaction_record("tx-1", "alice", "climate", "put", Some("exp1"))
            .await
            .unwrap();
        let sub = store
            .create_sub_record(trec.id, "sub-1", State::Failed)
            .await
            .unwrap();
        store
            .create_failed_file(sub.id, "/data/c.txt", "file too large")
            .await
            .unwrap();

        let failed = store.get_failed_files(sub.id).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, "file too large");
    }

    #[tokio::test]
    async fn warnings_attach_to_transaction_records() {
        let (_t, store) = store().await;
        let trec = store
            .create_transaction_record("tx-1", "alice", "climate", "put", None)
            .await
            .unwrap();
        store
            .create_warning(trec.id, "holding label defaulted to transaction id")
            .await
            .unwrap();
        let warnings = store.get_warnings(trec.id).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].warning.contains("defaulted"));
    }

    #[tokio::test]
    async fn transaction_records_unique_by_transaction_id() {
        let (_t, store) = store().await;
        store
            .create_transaction_record("tx-1", "alice", "climate", "put", None)
            .await
            .unwrap();
        assert!(store
            .create_transaction_record("tx-1", "alice", "climate", "put", None)
            .await
            .is_err());
        assert!(store
            .get_transaction_record("tx-1")
            .await
            .unwrap()
            .is_some());
    }
}
