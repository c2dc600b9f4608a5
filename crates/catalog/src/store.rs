//! Catalog store trait and the SQLite implementation.

use crate::error::{CatalogError, CatalogResult};
use crate::models::{
    AggregationRow, ChecksumRow, FileRow, HoldingRow, LocationRow, QuotaRow, TagRow,
    TransactionRow,
};
use async_trait::async_trait;
use nearline_core::{PathDetails, StorageType};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Filter for resolving files: any combination of path, transaction uuid,
/// holding id/label and tag pairs.
#[derive(Clone, Debug, Default)]
pub struct FileQuery {
    pub original_path: Option<String>,
    pub transaction_id: Option<String>,
    pub holding_id: Option<i64>,
    pub holding_label: Option<String>,
    pub tags: Vec<(String, String)>,
}

impl FileQuery {
    pub fn by_path(path: impl Into<String>) -> Self {
        Self {
            original_path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// The persistent holdings/transactions/files/locations/aggregations store.
///
/// All catalog worker operations go through this trait; implementations
/// exist for SQLite (development) and PostgreSQL (production).
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn migrate(&self) -> CatalogResult<()>;
    async fn health_check(&self) -> CatalogResult<()>;

    // holdings
    async fn get_holding_by_label(
        &self,
        user: &str,
        group: &str,
        label: &str,
    ) -> CatalogResult<Option<HoldingRow>>;
    async fn get_holding_by_id(
        &self,
        user: &str,
        group: &str,
        id: i64,
    ) -> CatalogResult<Option<HoldingRow>>;
    async fn create_holding(
        &self,
        user: &str,
        group: &str,
        label: &str,
    ) -> CatalogResult<HoldingRow>;
    async fn list_holdings(&self, user: &str, group: &str) -> CatalogResult<Vec<HoldingRow>>;
    async fn holding_of_transaction(&self, transaction_row_id: i64) -> CatalogResult<HoldingRow>;

    // tags
    async fn create_tag(&self, holding_id: i64, key: &str, value: &str) -> CatalogResult<TagRow>;
    async fn get_tags(&self, holding_id: i64) -> CatalogResult<Vec<TagRow>>;

    // transactions
    async fn get_transaction(&self, transaction_id: &str) -> CatalogResult<Option<TransactionRow>>;
    async fn create_transaction(
        &self,
        holding_id: i64,
        transaction_id: &str,
    ) -> CatalogResult<TransactionRow>;
    async fn file_transaction(&self, file_id: i64) -> CatalogResult<TransactionRow>;

    // files
    async fn file_exists_in_holding(
        &self,
        holding_id: i64,
        original_path: &str,
    ) -> CatalogResult<bool>;
    /// Distinguishes a replayed put (same transaction) from a user
    /// duplicate (same holding, different transaction).
    async fn file_exists_in_transaction(
        &self,
        transaction_row_id: i64,
        original_path: &str,
    ) -> CatalogResult<bool>;
    async fn create_file(
        &self,
        transaction_row_id: i64,
        details: &PathDetails,
    ) -> CatalogResult<FileRow>;
    async fn delete_file(&self, file_id: i64) -> CatalogResult<()>;
    async fn get_files(
        &self,
        user: &str,
        group: &str,
        query: &FileQuery,
    ) -> CatalogResult<Vec<FileRow>>;

    // locations
    async fn get_file_locations(&self, file_id: i64) -> CatalogResult<Vec<LocationRow>>;
    async fn get_location(
        &self,
        file_id: i64,
        storage_type: StorageType,
    ) -> CatalogResult<Option<LocationRow>>;
    #[allow(clippy::too_many_arguments)]
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
    ) -> CatalogResult<LocationRow>;
    /// Fill an empty-marker location in with its final path.
    async fn fill_location(
        &self,
        location_id: i64,
        path: &str,
        access_time: OffsetDateTime,
        aggregation_id: Option<i64>,
    ) -> CatalogResult<()>;
    async fn delete_location(&self, file_id: i64, storage_type: StorageType) -> CatalogResult<()>;

    // archive candidates
    async fn next_unarchived_holding(&self) -> CatalogResult<Option<HoldingRow>>;
    async fn unarchived_files(&self, holding_id: i64) -> CatalogResult<Vec<FileRow>>;

    // aggregations
    async fn create_aggregation(&self, tarname: &str) -> CatalogResult<AggregationRow>;
    async fn get_aggregation(&self, id: i64) -> CatalogResult<Option<AggregationRow>>;
    async fn get_aggregation_by_tarname(
        &self,
        tarname: &str,
    ) -> CatalogResult<Option<AggregationRow>>;
    /// The TAPE locations of every member file.
    async fn aggregation_members(&self, aggregation_id: i64) -> CatalogResult<Vec<LocationRow>>;
    async fn update_aggregation(
        &self,
        id: i64,
        checksum: &str,
        algorithm: &str,
    ) -> CatalogResult<()>;
    async fn fail_aggregation(&self, id: i64) -> CatalogResult<()>;
    async fn delete_aggregation(&self, id: i64) -> CatalogResult<()>;

    // checksums
    async fn create_checksum(
        &self,
        file_id: i64,
        checksum: &str,
        algorithm: &str,
    ) -> CatalogResult<ChecksumRow>;
    async fn get_checksums(&self, file_id: i64) -> CatalogResult<Vec<ChecksumRow>>;

    // quotas
    async fn get_quota(&self, group: &str) -> CatalogResult<Option<QuotaRow>>;
    async fn upsert_quota(&self, group: &str, size: i64, used: i64) -> CatalogResult<()>;
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS holdings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    user_name TEXT NOT NULL,
    group_name TEXT NOT NULL,
    UNIQUE (label, user_name)
);
CREATE INDEX IF NOT EXISTS idx_holdings_label ON holdings (label);

CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id TEXT NOT NULL,
    ingest_time TEXT NOT NULL,
    holding_id INTEGER NOT NULL REFERENCES holdings (id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_transactions_uuid ON transactions (transaction_id);
CREATE INDEX IF NOT EXISTS idx_transactions_holding ON transactions (holding_id);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    holding_id INTEGER NOT NULL REFERENCES holdings (id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_tags_holding ON tags (holding_id);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    transaction_id INTEGER NOT NULL REFERENCES transactions (id) ON DELETE CASCADE,
    original_path TEXT NOT NULL,
    path_type TEXT NOT NULL,
    link_path TEXT,
    size INTEGER NOT NULL,
    file_user INTEGER NOT NULL,
    file_group INTEGER NOT NULL,
    file_permissions INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_transaction ON files (transaction_id);
CREATE INDEX IF NOT EXISTS idx_files_path ON files (original_path);

CREATE TABLE IF NOT EXISTS aggregations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tarname TEXT NOT NULL UNIQUE,
    checksum TEXT,
    algorithm TEXT,
    failed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS locations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    storage_type TEXT NOT NULL,
    url_scheme TEXT NOT NULL,
    url_netloc TEXT NOT NULL,
    root TEXT NOT NULL,
    path TEXT NOT NULL,
    access_time TEXT NOT NULL,
    file_id INTEGER NOT NULL REFERENCES files (id) ON DELETE CASCADE,
    aggregation_id INTEGER REFERENCES aggregations (id),
    UNIQUE (file_id, storage_type)
);
CREATE INDEX IF NOT EXISTS idx_locations_file ON locations (file_id);
CREATE INDEX IF NOT EXISTS idx_locations_aggregation ON locations (aggregation_id);

CREATE TABLE IF NOT EXISTS checksums (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    checksum TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    file_id INTEGER NOT NULL REFERENCES files (id) ON DELETE CASCADE,
    UNIQUE (checksum, algorithm, file_id)
);

CREATE TABLE IF NOT EXISTS quotas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_name TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    used INTEGER NOT NULL DEFAULT 0
);
"#;

/// SQLite-backed catalog.
pub struct SqliteCatalog {
    pool: Pool<Sqlite>,
}

impl SqliteCatalog {
    pub async fn new(path: impl AsRef<Path>) -> CatalogResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::Config(e.to_string()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(CatalogError::Db)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // avoids persistent lock failures when the catalog worker and the
            // RPC readers overlap.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    async fn migrate(&self) -> CatalogResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
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
        let row = sqlx::query_as::<_, HoldingRow>(
            "SELECT * FROM holdings WHERE user_name = ? AND group_name = ? AND label = ?",
        )
        .bind(user)
        .bind(group)
        .bind(label)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_holding_by_id(
        &self,
        user: &str,
        group: &str,
        id: i64,
    ) -> CatalogResult<Option<HoldingRow>> {
        let row = sqlx::query_as::<_, HoldingRow>(
            "SELECT * FROM holdings WHERE user_name = ? AND group_name = ? AND id = ?",
        )
        .bind(user)
        .bind(group)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_holding(
        &self,
        user: &str,
        group: &str,
        label: &str,
    ) -> CatalogResult<HoldingRow> {
        let row = sqlx::query_as::<_, HoldingRow>(
            "INSERT INTO holdings (label, user_name, group_name) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(label)
        .bind(user)
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                CatalogError::AlreadyExists(format!("holding with label {label}"))
            }
            _ => CatalogError::Db(e),
        })?;
        Ok(row)
    }

    async fn list_holdings(&self, user: &str, group: &str) -> CatalogResult<Vec<HoldingRow>> {
        let rows = sqlx::query_as::<_, HoldingRow>(
            "SELECT * FROM holdings WHERE user_name = ? AND group_name = ? ORDER BY label",
        )
        .bind(user)
        .bind(group)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn holding_of_transaction(&self, transaction_row_id: i64) -> CatalogResult<HoldingRow> {
        let row = sqlx::query_as::<_, HoldingRow>(
            "SELECT h.* FROM holdings h \
             JOIN transactions t ON t.holding_id = h.id \
             WHERE t.id = ?",
        )
        .bind(transaction_row_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CatalogError::NotFound(format!("holding of transaction {transaction_row_id}")))
    }

    async fn create_tag(&self, holding_id: i64, key: &str, value: &str) -> CatalogResult<TagRow> {
        let row = sqlx::query_as::<_, TagRow>(
            "INSERT INTO tags (key, value, holding_id) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(key)
        .bind(value)
        .bind(holding_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_tags(&self, holding_id: i64) -> CatalogResult<Vec<TagRow>> {
        let rows =
            sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE holding_id = ? ORDER BY key")
                .bind(holding_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> CatalogResult<Option<TransactionRow>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE transaction_id = ?",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_transaction(
        &self,
        holding_id: i64,
        transaction_id: &str,
    ) -> CatalogResult<TransactionRow> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "INSERT INTO transactions (transaction_id, ingest_time, holding_id) \
             VALUES (?, ?, ?) RETURNING *",
        )
        .bind(transaction_id)
        .bind(OffsetDateTime::now_utc())
        .bind(holding_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn file_transaction(&self, file_id: i64) -> CatalogResult<TransactionRow> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT t.* FROM transactions t JOIN files f ON f.transaction_id = t.id \
             WHERE f.id = ?",
        )
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CatalogError::NotFound(format!("transaction of file {file_id}")))
    }

    async fn file_exists_in_holding(
        &self,
        holding_id: i64,
        original_path: &str,
    ) -> CatalogResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS( \
                SELECT 1 FROM files f \
                JOIN transactions t ON f.transaction_id = t.id \
                WHERE t.holding_id = ? AND f.original_path = ?)",
        )
        .bind(holding_id)
        .bind(original_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn file_exists_in_transaction(
        &self,
        transaction_row_id: i64,
        original_path: &str,
    ) -> CatalogResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS( \
                SELECT 1 FROM files WHERE transaction_id = ? AND original_path = ?)",
        )
        .bind(transaction_row_id)
        .bind(original_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn create_file(
        &self,
        transaction_row_id: i64,
        details: &PathDetails,
    ) -> CatalogResult<FileRow> {
        let row = sqlx::query_as::<_, FileRow>(
            "INSERT INTO files \
             (transaction_id, original_path, path_type, link_path, size, \
              file_user, file_group, file_permissions) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
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
        .await?;
        Ok(row)
    }

    async fn delete_file(&self, file_id: i64) -> CatalogResult<()> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
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
             WHERE h.user_name = ? AND h.group_name = ?",
        );
        if query.original_path.is_some() {
            sql.push_str(" AND f.original_path = ?");
        }
        if query.transaction_id.is_some() {
            sql.push_str(" AND t.transaction_id = ?");
        }
        if query.holding_id.is_some() {
            sql.push_str(" AND h.id = ?");
        }
        if query.holding_label.is_some() {
            sql.push_str(" AND h.label = ?");
        }
        for _ in &query.tags {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM tags g \
                 WHERE g.holding_id = h.id AND g.key = ? AND g.value = ?)",
            );
        }
        sql.push_str(" ORDER BY t.ingest_time DESC, f.id");

        let mut q = sqlx::query_as::<_, FileRow>(&sql).bind(user).bind(group);
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
        let rows = sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations WHERE file_id = ? ORDER BY storage_type",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn get_location(
        &self,
        file_id: i64,
        storage_type: StorageType,
    ) -> CatalogResult<Option<LocationRow>> {
        let row = sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations WHERE file_id = ? AND storage_type = ?",
        )
        .bind(file_id)
        .bind(storage_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
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
        let row = sqlx::query_as::<_, LocationRow>(
            "INSERT INTO locations \
             (storage_type, url_scheme, url_netloc, root, path, access_time, \
              file_id, aggregation_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
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
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                CatalogError::AlreadyExists(format!(
                    "{storage_type} location for file {file_id}"
                ))
            }
            _ => CatalogError::Db(e),
        })?;
        Ok(row)
    }

    async fn fill_location(
        &self,
        location_id: i64,
        path: &str,
        access_time: OffsetDateTime,
        aggregation_id: Option<i64>,
    ) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE locations SET path = ?, access_time = ?, \
             aggregation_id = COALESCE(?, aggregation_id) WHERE id = ?",
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
        sqlx::query("DELETE FROM locations WHERE file_id = ? AND storage_type = ?")
            .bind(file_id)
            .bind(storage_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_unarchived_holding(&self) -> CatalogResult<Option<HoldingRow>> {
        // oldest holding first so archive cycles drain the backlog in order
        let row = sqlx::query_as::<_, HoldingRow>(
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
        .await?;
        Ok(row)
    }

    async fn unarchived_files(&self, holding_id: i64) -> CatalogResult<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT f.* FROM files f \
             JOIN transactions t ON f.transaction_id = t.id \
             WHERE t.holding_id = ? \
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
        .await?;
        Ok(rows)
    }

    async fn create_aggregation(&self, tarname: &str) -> CatalogResult<AggregationRow> {
        let row = sqlx::query_as::<_, AggregationRow>(
            "INSERT INTO aggregations (tarname) VALUES (?) RETURNING *",
        )
        .bind(tarname)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.message().contains("UNIQUE") => {
                CatalogError::AlreadyExists(format!("aggregation {tarname}"))
            }
            _ => CatalogError::Db(e),
        })?;
        Ok(row)
    }

    async fn get_aggregation(&self, id: i64) -> CatalogResult<Option<AggregationRow>> {
        let row =
            sqlx::query_as::<_, AggregationRow>("SELECT * FROM aggregations WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn get_aggregation_by_tarname(
        &self,
        tarname: &str,
    ) -> CatalogResult<Option<AggregationRow>> {
        let row =
            sqlx::query_as::<_, AggregationRow>("SELECT * FROM aggregations WHERE tarname = ?")
                .bind(tarname)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn aggregation_members(&self, aggregation_id: i64) -> CatalogResult<Vec<LocationRow>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            "SELECT * FROM locations WHERE aggregation_id = ? AND storage_type = 'TAPE' \
             ORDER BY file_id",
        )
        .bind(aggregation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_aggregation(
        &self,
        id: i64,
        checksum: &str,
        algorithm: &str,
    ) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE aggregations SET checksum = ?, algorithm = ?, failed = 0 WHERE id = ?",
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
        sqlx::query("UPDATE aggregations SET failed = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_aggregation(&self, id: i64) -> CatalogResult<()> {
        // detach member locations first so the FK holds
        sqlx::query("UPDATE locations SET aggregation_id = NULL WHERE aggregation_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM aggregations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_checksum(
        &self,
        file_id: i64,
        checksum: &str,
        algorithm: &str,
    ) -> CatalogResult<ChecksumRow> {
        let row = sqlx::query_as::<_, ChecksumRow>(
            "INSERT INTO checksums (checksum, algorithm, file_id) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(checksum)
        .bind(algorithm)
        .bind(file_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_checksums(&self, file_id: i64) -> CatalogResult<Vec<ChecksumRow>> {
        let rows =
            sqlx::query_as::<_, ChecksumRow>("SELECT * FROM checksums WHERE file_id = ?")
                .bind(file_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn get_quota(&self, group: &str) -> CatalogResult<Option<QuotaRow>> {
        let row = sqlx::query_as::<_, QuotaRow>("SELECT * FROM quotas WHERE group_name = ?")
            .bind(group)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn upsert_quota(&self, group: &str, size: i64, used: i64) -> CatalogResult<()> {
        sqlx::query(
            "INSERT INTO quotas (group_name, size, used) VALUES (?, ?, ?) \
             ON CONFLICT(group_name) DO UPDATE SET size = excluded.size, used = excluded.used",
        )
        .bind(group)
        .bind(size)
        .bind(used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
