//! Row types for the catalog database.
//!
//! Surrogate integer ids throughout; relationships are foreign keys, never
//! in-memory object graphs.

use nearline_core::{PathDetails, PathLocation, StorageType};
use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;

/// A user-labelled collection of transactions. `(user_name, label)` is
/// unique.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct HoldingRow {
    pub id: i64,
    pub label: String,
    pub user_name: String,
    pub group_name: String,
}

/// One user put-batch. Splitting downstream creates more sub-transactions
/// but never more rows: the uuid stays singular.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct TransactionRow {
    pub id: i64,
    pub transaction_id: String,
    pub ingest_time: OffsetDateTime,
    pub holding_id: i64,
}

/// A key/value tag on a holding.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct TagRow {
    pub id: i64,
    pub key: String,
    pub value: String,
    pub holding_id: i64,
}

/// A single catalogued file.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct FileRow {
    pub id: i64,
    pub transaction_id: i64,
    pub original_path: String,
    pub path_type: String,
    pub link_path: Option<String>,
    pub size: i64,
    pub file_user: i64,
    pub file_group: i64,
    pub file_permissions: i64,
}

/// A file's placement on one storage tier. An empty `path` marks a transfer
/// or recall in progress, which is what stops concurrent work being
/// scheduled twice.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct LocationRow {
    pub id: i64,
    pub storage_type: String,
    pub url_scheme: String,
    pub url_netloc: String,
    pub root: String,
    pub path: String,
    pub access_time: OffsetDateTime,
    pub file_id: i64,
    pub aggregation_id: Option<i64>,
}

impl LocationRow {
    pub fn is_empty_marker(&self) -> bool {
        self.path.is_empty()
    }

    /// Convert to the wire-level location carried in PathDetails.
    pub fn to_path_location(&self) -> nearline_core::Result<PathLocation> {
        Ok(PathLocation {
            storage_type: StorageType::parse(&self.storage_type)?,
            url_scheme: self.url_scheme.clone(),
            url_netloc: self.url_netloc.clone(),
            root: self.root.clone(),
            path: self.path.clone(),
            access_time: Some(self.access_time.unix_timestamp()),
            aggregation_id: self.aggregation_id,
        })
    }
}

/// A tape-resident bundle of files.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct AggregationRow {
    pub id: i64,
    pub tarname: String,
    pub checksum: Option<String>,
    pub algorithm: Option<String>,
    pub failed: bool,
}

/// A per-file checksum.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct ChecksumRow {
    pub id: i64,
    pub checksum: String,
    pub algorithm: String,
    pub file_id: i64,
}

/// Per-group usage accounting.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct QuotaRow {
    pub id: i64,
    pub group_name: String,
    pub size: i64,
    pub used: i64,
}

/// Rebuild the per-file record a stage message carries from catalog rows.
pub fn path_details_from_rows(
    file: &FileRow,
    locations: &[LocationRow],
) -> nearline_core::Result<PathDetails> {
    let mut details = PathDetails::from_path(file.original_path.clone());
    details.path_type = nearline_core::PathType::parse(&file.path_type)?;
    details.link_target = file.link_path.clone();
    details.size = Some(file.size as u64);
    details.uid = Some(file.file_user as u32);
    details.gid = Some(file.file_group as u32);
    details.permissions = Some(file.file_permissions as u32);
    for location in locations {
        details.locations.add(location.to_path_location()?)?;
        if location.storage_type == StorageType::ObjectStore.as_str()
            && !location.path.is_empty()
        {
            details.object_name = Some(format!("{}/{}", location.root, location.path));
        }
    }
    Ok(details)
}
