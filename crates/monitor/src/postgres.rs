//! PostgreSQL implementation of the monitor store.

use crate::error::{MonitorError, MonitorResult};
use crate::models::{FailedFileRow, SubRecordRow, TransactionRecordRow, WarningRow};
use crate::store::MonitorStore;
use async_trait::async_trait;
use nearline_core::State;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use time::OffsetDateTime;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS transaction_records (
        id BIGSERIAL PRIMARY KEY,
        transaction_id TEXT NOT NULL UNIQUE,
        user_name TEXT NOT NULL,
        group_name TEXT NOT NULL,
        api_action TEXT NOT NULL,
        job_label TEXT,
        creation_time TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_trec_user ON transaction_records (user_name, group_name)",
    "CREATE TABLE IF NOT EXISTS sub_records (
        id BIGSERIAL PRIMARY KEY,
        sub_id TEXT NOT NULL UNIQUE,
        state TEXT NOT NULL,
        retry_count BIGINT NOT NULL DEFAULT 0,
        last_updated TIMESTAMPTZ NOT NULL,
        transaction_record_id BIGINT NOT NULL
            REFERENCES transaction_records (id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_srec_trec ON sub_records (transaction_record_id)",
    "CREATE TABLE IF NOT EXISTS failed_files (
        id BIGSERIAL PRIMARY KEY,
        filepath TEXT NOT NULL,
        reason TEXT NOT NULL,
        sub_record_id BIGINT NOT NULL REFERENCES sub_records (id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_ff_srec ON failed_files (sub_record_id)",
    "CREATE TABLE IF NOT EXISTS warnings (
        id BIGSERIAL PRIMARY KEY,
        warning TEXT NOT NULL,
        transaction_record_id BIGINT NOT NULL
            REFERENCES transaction_records (id) ON DELETE CASCADE
    )",
];

/// PostgreSQL-backed monitor.
pub struct PostgresMonitor {
    pool: PgPool,
}

impl PostgresMonitor {
    pub async fn from_url(url: &str, max_connections: u32) -> MonitorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }
}

#[async_trait]
impl MonitorStore for PostgresMonitor {
    async fn migrate(&self) -> MonitorResult<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
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
            "SELECT * FROM transaction_records WHERE transaction_id = $1",
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
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
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
             WHERE user_name = $1 AND group_name = $2 ORDER BY creation_time DESC",
        )
        .bind(user)
        .bind(group)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_sub_record(&self, sub_id: &str) -> MonitorResult<Option<SubRecordRow>> {
        Ok(sqlx::query_as::<_, SubRecordRow>(
            "SELECT * FROM sub_records WHERE sub_id = $1",
        )
        .bind(sub_id)
        .fetch_optional(&self.pool)
        .await?)
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
             VALUES ($1, $2, 0, $3, $4) RETURNING *",
        )
        .bind(sub_id)
        .bind(state.as_str())
        .bind(OffsetDateTime::now_utc())
        .bind(transaction_record_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn ratchet_sub_record(&self, sub_id: &str, state: State) -> MonitorResult<bool> {
        // lock the row so concurrent monitor consumers serialise per sub
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, SubRecordRow>(
            "SELECT * FROM sub_records WHERE sub_id = $1 FOR UPDATE",
        )
        .bind(sub_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MonitorError::NotFound(format!("sub record {sub_id}")))?;

        let current_state = current.parsed_state()?;
        if !current_state.ratchet_allows(state) {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("UPDATE sub_records SET state = $1, last_updated = $2 WHERE sub_id = $3")
            .bind(state.as_str())
            .bind(OffsetDateTime::now_utc())
            .bind(sub_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn set_retry_count(&self, sub_id: &str, retry_count: i64) -> MonitorResult<()> {
        sqlx::query("UPDATE sub_records SET retry_count = $1 WHERE sub_id = $2")
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
            "SELECT * FROM sub_records WHERE transaction_record_id = $1 ORDER BY id",
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
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(filepath)
        .bind(reason)
        .bind(sub_record_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_failed_files(&self, sub_record_id: i64) -> MonitorResult<Vec<FailedFileRow>> {
        Ok(sqlx::query_as::<_, FailedFileRow>(
            "SELECT * FROM failed_files WHERE sub_record_id = $1 ORDER BY id",
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
            "INSERT INTO warnings (warning, transaction_record_id) \
             VALUES ($1, $2) RETURNING *",
        )
        .bind(warning)
        .bind(transaction_record_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_warnings(&self, transaction_record_id: i64) -> MonitorResult<Vec<WarningRow>> {
        Ok(sqlx::query_as::<_, WarningRow>(
            "SELECT * FROM warnings WHERE transaction_record_id = $1 ORDER BY id",
        )
        .bind(transaction_record_id)
        .fetch_all(&self.pool)
        .await?)
    }
}
