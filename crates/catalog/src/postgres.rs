//! PostgreSQL implementation of the catalog store.

use crate::error::{CatalogError, CatalogResult};
use crate::models::{
    AggregationRow, ChecksumRow, FileRow, HoldingRow, LocationRow, QuotaRow, TagRow,
    TransactionRow,
};
use crate::store::{CatalogStore, FileQuery};
use async_trait::async_trait;
use nearline_core::{PathDetails, StorageType};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS holdings (
        id BIGSERIAL PRIMARY KEY,
        label TEXT NOT NULL,
        user_name TEXT NOT NULL,
        group_name TEXT NOT NULL,
        UNIQUE (label, user_name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_holdings_label ON holdings (label)",
    "CREATE TABLE IF NOT EXISTS transactions (
        id BIGSERIAL PRIMARY KEY,
        transaction_id TEXT NOT NULL,
        ingest_time TIMESTAMPTZ NOT NULL,
        holding_id BIGINT NOT NULL REFERENCES holdings (id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_uuid ON transactions (transaction_id)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_holding ON transactions (holding_id)",
    "CREATE TABLE IF NOT EXISTS tags (
        id BIGSERIAL PRIMARY KEY,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        holding_id BIGINT NOT NULL REFERENCES holdings (id) ON DELETE CASCADE
    )",
    "CREATE INDEX IF NOT EXISTS idx_tags_holding ON tags (holding_id)",
    "CREATE TABLE IF NOT EXISTS files (
        id BIGSERIAL PRIMARY KEY,
        transaction_id BIGINT NOT NULL REFERENCES transactions (id) ON DELETE CASCADE,
        original_path TEXT NOT NULL,
        path_type TEXT NOT NULL,
        link_path TEXT,
        size BIGINT NOT NULL,
        file_user BIGINT NOT NULL,
        file_group BIGINT NOT NULL,
        file_permissions BIGINT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_files_transaction ON files (transaction_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_path ON files (original_path)",
    "CREATE TABLE IF NOT EXISTS aggregations (
        id BIGSERIAL PRIMARY KEY,
        tarname TEXT NOT NULL UNIQUE,
        checksum TEXT,
        algorithm TEXT,
        failed BOOLEAN NOT NULL DEFAULT FALSE
    )",
    "CREATE TABLE IF NOT EXISTS locations (
        id BIGSERIAL PRIMARY KEY,
        storage_type TEXT NOT NULL,
        url_scheme TEXT NOT NULL,
        url_netloc TEXT NOT NULL,
        root TEXT NOT NULL,
        path TEXT NOT NULL,
        access_time TIMESTAMPTZ NOT NULL,
        file_id BIGINT NOT NULL REFERENCES files (id) ON DELETE CASCADE,
        aggregation_id BIGINT REFERENCES aggregations (id),
        UNIQUE (file_id, storage_type)
    )",
    "CREATE INDEX IF NOT EXISTS idx_locations_file ON locations (file_id)",
    "CREATE INDEX IF NOT EXISTS idx_locations_aggregation ON locations (aggregation_id)",
    "CREATE TABLE IF NOT EXISTS checksums (
        id BIGSERIAL PRIMARY KEY,
        checksum TEXT NOT NULL,
        algorithm TEXT NOT NULL,
        file_id BIGINT NOT NULL REFERENCES files (id) ON DELETE CASCADE,
        UNIQUE (checksum, algorithm, file_id)
    )",
    "CREATE TABLE IF NOT EXISTS quotas (
        id BIGSERIAL PRIMARY KEY,
        group_name TEXT NOT NULL UNIQUE,
        size BIGINT NOT NULL,
        used BIGINT NOT NULL DEFAULT 0
    )",
];

fn map_unique(e: sqlx::Error, what: String) -> CatalogError {
    match &e {
        sqlx::Error::Database(db) if db.constraint().is_some() => CatalogError::AlreadyExists(what),
        _ => CatalogError::Db(e),
    }
}

/// PostgreSQL-backed catalog.
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    pub async fn from_url(url: &str, max_connections: u32) -> CatalogResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogStore for PostgresCatalog {
    async fn migrate(&self) -> CatalogResult<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> CatalogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_holding_by_label(
        &self,
        user: &str,
        group: &str,
        label: &str,
    ) -> CatalogResult<Option<HoldingRow>> {
        Ok(sqlx::query_as::<_, HoldingRow>(
            "SELECT * FROM holdings WHERE user_name = $1 AND group_name = $2 AND label = $3",
        )
        .bind(user)
        .bind(group)
        .bind(label)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn get_holding_by_id(
        &self,
        user: &str,
        group: &str,
        id: i64,
    ) -> CatalogResult<Option<HoldingRow>> {
        Ok(sqlx::query_as::<_, HoldingRow>(
            "SELECT * FROM holdings WHERE user_name = $1 AND group_name = $2 AND id = $3",
        )
        .bind(user)
        .bind(group)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn create_holding(
        &self,
        user: &str,
        group: &str,
        label: &str,
    ) -> CatalogResult<HoldingRow> {
        sqlx::query_as::<_, HoldingRow>(
            "INSERT INTO holdings (label, user_name, group_name) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(label)
        .bind(user)
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, format!("holding with label {label}")))
    }

    async fn list_holdings(&self, user: &str, group: &str) -> CatalogResult<Vec<HoldingRow>> {
        Ok(sqlx::query_as::<_, HoldingRow>(
            "SELECT * FROM holdings WHERE user_name = $1 AND group_name = $2 ORDER BY label",
        )
        .bind(user)
        .bind(group)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn holding_of_transaction(&self, transaction_row_id: i64) -> CatalogResult<HoldingRow> {
        sqlx::query_as::<_, HoldingRow>(
            "SELECT h.* FROM holdings h JOIN transactions t ON t.holding_id = h.id \
             WHERE t.id = $1",
        )
        .bind(transaction_row_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            CatalogError::NotFound(format!("holding of transaction {transaction_row_id}"))
        })
    }

    async fn create_tag(&self, holding_id: i64, key: &str, value: &str) -> CatalogResult<TagRow> {
        Ok(sqlx::query_as::<_, TagRow>(
            "INSERT INTO tags (key, value, holding_id) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(key)
        .bind(value)
        .bind(holding_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_tags(&self, holding_id: i64) -> CatalogResult<Vec<TagRow>> {
        Ok(sqlx::query_as::<_, TagRow>(
            "SELECT * FROM tags WHERE holding_id = $1 ORDER BY key",
        )
        .bind(holding_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> CatalogResult<Option<TransactionRow>> {
        Ok(sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE transaction_id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn create_transaction(
        &self,
        holding_id: i64,
        transaction_id: &str,
    ) -> CatalogResult<TransactionRow> {
        Ok(sqlx::query_as::<_, TransactionRow>(
            "INSERT INTO transactions (transaction_id, ingest_time, holding_id) \
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(transaction_id)
        .bind(OffsetDateTime::now_utc())
        .bind(holding_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn file_transaction(&self, file_id: i64) -> CatalogResult<TransactionRow> {
        sqlx::query_as::<_, TransactionRow>(
            "SELECT t.* FROM transactions t JOIN files f ON f.transaction_id = t.id \
             WHERE f.id = $1",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CatalogError::NotFound(format!("transaction of file {file_id}")))
    }

    async fn file_exists_in_holding(
        &self,
        holding_id: i64,
        original_path: &str,
    ) -> CatalogResult<bool> {
        Ok(sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS( \
                SELECT 1 FROM files f \
                JOIN transactions t ON f.transaction_id = t.id \
                WHERE t.holding_id = $1 AND f.original_path = $2)",
        )
        .bind(holding_id)
        .bind(original_path)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn file_exists_in_transaction(
        &self,
        transaction_row_id: i64,
        original_path: &str,
    ) -> CatalogResult<bool> {
        Ok(sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS( \
                SELECT 1 FROM files WHERE transaction_id = $1 AND original_path = $2)",
        )
        .bind(transaction_row_id)
        .bind(original_path)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn create_file(
        &self,
        transaction_row_id: i64,
        details: &PathDetails,
    ) -> CatalogResult<FileRow> {
        Ok(sqlx::query_as::<_, FileRow>(
            "INSERT INTO files \
             (transaction_id, original_path, path_type, link_path, size, \
              file_user, file_group, file_permissions) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(transaction_row_id)
        .bind(&details.original_path)
        .bind(details.path_type.as_str())
        .bind(&details.link_target)
        .bind(details.size.unwrap_or(0) as i64)
        .bind(details.uid.unwrap_or(0) as i64)
        .bind(details.gid.unwrap_or(0) as i64)
        .bind(details.permissions.unwrap_or(0) as i64)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn delete_file(&self, file_id: i64) -> CatalogResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!("file {file_id}")));
        }
        Ok(())
    }

    async fn get_files(
        &self,
        user: &str,
        group: &str,
        query: &FileQuery,
    ) -> CatalogResult<Vec<FileRow>> {
        let mut sql = String::from(
            "SELECT f.* FROM files f \
             JOIN transactions t ON t.id = f.transaction_id \
             JOIN holdings h ON h.id = t.holding_id \
             WHERE h.user_name = $1 AND h.group_name = $2",
        );
        let mut arg = 2;
        let mut next = || {
            arg += 1;
            arg
        };
        if query.original_path.is_some() {
            sql.push_str(&format!(" AND f.original_path = ${}", next()));
        }
        if query.transaction_id.is_some() {
            sql.push_str(&format!(" AND t.transaction_id = ${}", next()));
        }
        if query.holding_id.is_some() {
            sql.push_str(&format!(" AND h.id = ${}", next()));
        }
        if query.holding_label.is_some() {
            sql.push_str(&format!(" AND h.label = ${}", next()));
        }
        for _ in &query.tags {
            let key_arg = next();
            let value_arg = next();
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM tags g \
                 WHERE g.holding_id = h.id AND g.key = ${key_arg} AND g.value = ${value_arg})"
            ));
        }
        sql.push_str(" ORDER BY t.ingest_time DESC, f.id");

        let mut q = sqlx::query_as::<Postgres, FileRow>(&sql).bind(user).bind(group);
        if let Some(path) = &query.original_path {
            q = q.bind(path);
        }
        if let Some(txid) = &query.transaction_id {
            q = q.bind(txid);
        }
        if let Some(id) = query.holding_id {
            q = q.bind(id);
        }
        if let Some(label) = &query.holding_label {
            q = q.bind(label);
        }
        for (key, value) in &query.tags {
            q = q.bind(key).bind(value);
        }

        Ok(q.fetch_all(&self.pool).await?)
    }

    async fn get_file_locations(&self, file_id: i64) -> CatalogResult<Vec<LocationRow>> {
        Ok(sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations WHERE file_id = $1 ORDER BY storage_type",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_location(
        &self,
        file_id: i64,
        storage_type: StorageType,
    ) -> CatalogResult<Option<LocationRow>> {
        Ok(sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations WHERE file_id = $1 AND storage_type = $2",
        )
        .bind(file_id)
        .bind(storage_type.as_str())
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn create_location(
        &self,
        file_id: i64,
        storage_type: StorageType,
        url_scheme: &str,
        url_netloc: &str,
        root: &str,
        path: &str,
        access_time: OffsetDateTime,
        aggregation_id: Option<i64>,
    ) -> CatalogResult<LocationRow> {
        sqlx::query_as::<_, LocationRow>(
            "INSERT INTO locations \
             (storage_type, url_scheme, url_netloc, root, path, access_time, \
              file_id, aggregation_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
        )
        .bind(storage_type.as_str())
        .bind(url_scheme)
        .bind(url_netloc)
        .bind(root)
        .bind(path)
        .bind(access_time)
        .bind(file_id)
        .bind(aggregation_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, format!("{storage_type} location for file {file_id}")))
    }

    async fn fill_location(
        &self,
        location_id: i64,
        path: &str,
        access_time: OffsetDateTime,
        aggregation_id: Option<i64>,
    ) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE locations SET path = $1, access_time = $2, \
             aggregation_id = COALESCE($3, aggregation_id) WHERE id = $4",
        )
        .bind(path)
        .bind(access_time)
        .bind(aggregation_id)
        .bind(location_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!("location {location_id}")));
        }
        Ok(())
    }

    async fn delete_location(
        &self,
        file_id: i64,
        storage_type: StorageType,
    ) -> CatalogResult<()> {
        sqlx::query("DELETE FROM locations WHERE file_id = $1 AND storage_type = $2")
            .bind(file_id)
            .bind(storage_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_unarchived_holding(&self) -> CatalogResult<Option<HoldingRow>> {
        Ok(sqlx::query_as::<_, HoldingRow>(
            "SELECT h.* FROM holdings h WHERE EXISTS ( \
                SELECT 1 FROM files f \
                JOIN transactions t ON f.transaction_id = t.id \
                WHERE t.holding_id = h.id \
                AND NOT EXISTS ( \
                    SELECT 1 FROM locations l \
                    WHERE l.file_id = f.id AND l.storage_type = 'TAPE') \
                AND EXISTS ( \
                    SELECT 1 FROM locations l \
                    WHERE l.file_id = f.id AND l.storage_type = 'OBJECT_STORE' \
                    AND l.path != '')) \
             ORDER BY h.id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn unarchived_files(&self, holding_id: i64) -> CatalogResult<Vec<FileRow>> {
        Ok(sqlx::query_as::<_, FileRow>(
            "SELECT f.* FROM files f \
             JOIN transactions t ON f.transaction_id = t.id \
             WHERE t.holding_id = $1 \
             AND NOT EXISTS ( \
                 SELECT 1 FROM locations l \
                 WHERE l.file_id = f.id AND l.storage_type = 'TAPE') \
             AND EXISTS ( \
                 SELECT 1 FROM locations l \
                 WHERE l.file_id = f.id AND l.storage_type = 'OBJECT_STORE' \
                 AND l.path != '') \
             ORDER BY f.id",
        )
        .bind(holding_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn create_aggregation(&self, tarname: &str) -> CatalogResult<AggregationRow> {
        sqlx::query_as::<_, AggregationRow>(
            "INSERT INTO aggregations (tarname) VALUES ($1) RETURNING *",
        )
        .bind(tarname)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique(e, format!("aggregation {tarname}")))
    }

    async fn get_aggregation(&self, id: i64) -> CatalogResult<Option<AggregationRow>> {
        Ok(
            sqlx::query_as::<_, AggregationRow>("SELECT * FROM aggregations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn get_aggregation_by_tarname(
        &self,
        tarname: &str,
    ) -> CatalogResult<Option<AggregationRow>> {
        Ok(sqlx::query_as::<_, AggregationRow>(
            "SELECT * FROM aggregations WHERE tarname = $1",
        )
        .bind(tarname)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn aggregation_members(&self, aggregation_id: i64) -> CatalogResult<Vec<LocationRow>> {
        Ok(sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations WHERE aggregation_id = $1 AND storage_type = 'TAPE' \
             ORDER BY file_id",
        )
        .bind(aggregation_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_aggregation(
        &self,
        id: i64,
        checksum: &str,
        algorithm: &str,
    ) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE aggregations SET checksum = $1, algorithm = $2, failed = FALSE WHERE id = $3",
        )
        .bind(checksum)
        .bind(algorithm)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(format!("aggregation {id}")));
        }
        Ok(())
    }

    async fn fail_aggregation(&self, id: i64) -> CatalogResult<()> {
        sqlx::query("UPDATE aggregations SET failed = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_aggregation(&self, id: i64) -> CatalogResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE locations SET aggregation_id = NULL WHERE aggregation_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM aggregations WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_checksum(
        &self,
        file_id: i64,
        checksum: &str,
        algorithm: &str,
    ) -> CatalogResult<ChecksumRow> {
        Ok(sqlx::query_as::<_, ChecksumRow>(
            "INSERT INTO checksums (checksum, algorithm, file_id) \
             VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(checksum)
        .bind(algorithm)
        .bind(file_id)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_checksums(&self, file_id: i64) -> CatalogResult<Vec<ChecksumRow>> {
        Ok(
            sqlx::query_as::<_, ChecksumRow>("SELECT * FROM checksums WHERE file_id = $1")
                .bind(file_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    async fn get_quota(&self, group: &str) -> CatalogResult<Option<QuotaRow>> {
        Ok(
            sqlx::query_as::<_, QuotaRow>("SELECT * FROM quotas WHERE group_name = $1")
                .bind(group)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn upsert_quota(&self, group: &str, size: i64, used: i64) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO quotas (group_name, size, used) VALUES ($1, $2, $3) \
             ON CONFLICT (group_name) DO UPDATE SET size = EXCLUDED.size, used = EXCLUDED.used",
        )
        .bind(group)
        .bind(size)
        .bind(used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
