//! Per-file records carried through every processing stage.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// What kind of filesystem entry a path refers to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathType {
    File,
    Directory,
    /// Symlink whose target lies inside the batch's common root; the target
    /// is recorded relative to that root.
    LinkCommon,
    /// Symlink pointing outside the batch; the target is absolute.
    LinkAbsolute,
    NotRecognised,
    #[default]
    Unindexed,
}

impl PathType {
    pub fn is_link(self) -> bool {
        matches!(self, PathType::LinkCommon | PathType::LinkAbsolute)
    }

    /// Stable textual name, used for the database columns.
    pub fn as_str(self) -> &'static str {
        match self {
            PathType::File => "file",
            PathType::Directory => "directory",
            PathType::LinkCommon => "link-common",
            PathType::LinkAbsolute => "link-absolute",
            PathType::NotRecognised => "not-recognised",
            PathType::Unindexed => "unindexed",
        }
    }

    pub fn parse(name: &str) -> Result<PathType> {
        Ok(match name {
            "file" => PathType::File,
            "directory" => PathType::Directory,
            "link-common" => PathType::LinkCommon,
            "link-absolute" => PathType::LinkAbsolute,
            "not-recognised" => PathType::NotRecognised,
            "unindexed" => PathType::Unindexed,
            other => return Err(Error::MalformedMessage(format!("unknown path type: {other}"))),
        })
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two storage tiers a file can be placed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    ObjectStore,
    Tape,
}

impl StorageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::ObjectStore => "OBJECT_STORE",
            StorageType::Tape => "TAPE",
        }
    }

    pub fn parse(name: &str) -> Result<StorageType> {
        Ok(match name {
            "OBJECT_STORE" => StorageType::ObjectStore,
            "TAPE" => StorageType::Tape,
            other => {
                return Err(Error::MalformedMessage(format!(
                    "unknown storage type: {other}"
                )))
            }
        })
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The placement of a file on one storage tier.
///
/// `url_scheme://url_netloc/root/path` addresses the stored bytes; for the
/// object store `root` is the bucket (the transaction id) and `path` the
/// object key, for tape `root` is the tape pool path and `path` the tar name.
/// An OBJECT_STORE location with an empty `path` is the recall-in-progress
/// marker; an empty TAPE `path` marks archive-in-progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathLocation {
    pub storage_type: StorageType,
    pub url_scheme: String,
    pub url_netloc: String,
    pub root: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_id: Option<i64>,
}

impl PathLocation {
    /// Full URL of the stored bytes.
    pub fn url(&self) -> String {
        format!(
            "{}://{}/{}/{}",
            self.url_scheme, self.url_netloc, self.root, self.path
        )
    }

    /// An empty `path` marks a transfer or recall that has not completed.
    pub fn is_empty_marker(&self) -> bool {
        self.path.is_empty()
    }
}

/// The set of locations a file is stored at — at most one per storage type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathLocations(Vec<PathLocation>);

impl PathLocations {
    pub fn add(&mut self, location: PathLocation) -> Result<()> {
        if self.has(location.storage_type) {
            return Err(Error::DuplicateLocation(location.storage_type));
        }
        self.0.push(location);
        Ok(())
    }

    pub fn get(&self, storage_type: StorageType) -> Option<&PathLocation> {
        self.0.iter().find(|l| l.storage_type == storage_type)
    }

    pub fn get_mut(&mut self, storage_type: StorageType) -> Option<&mut PathLocation> {
        self.0.iter_mut().find(|l| l.storage_type == storage_type)
    }

    pub fn has(&self, storage_type: StorageType) -> bool {
        self.get(storage_type).is_some()
    }

    pub fn remove(&mut self, storage_type: StorageType) {
        self.0.retain(|l| l.storage_type != storage_type);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathLocation> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Derive the deterministic object key for a path: the hex SHA-256 of the
/// original path. Uniqueness across transactions comes from the bucket,
/// which is the transaction id.
pub fn object_key(original_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(original_path.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Derive the fully-qualified object name, `{transaction_id}/{sha256_hex}`.
pub fn object_name(transaction_id: Uuid, original_path: &str) -> String {
    format!("{transaction_id}/{}", object_key(original_path))
}

/// A single unit of work flowing through the stages.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PathDetails {
    pub original_path: String,
    #[serde(default)]
    pub path_type: PathType,
    /// Assigned by transfer-put once the object is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Unix permission bits (the low nine bits of the mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_time: Option<i64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "PathLocations::is_empty")]
    pub locations: PathLocations,
}

impl PathDetails {
    pub fn from_path(original_path: impl Into<String>) -> Self {
        Self {
            original_path: original_path.into(),
            ..Default::default()
        }
    }

    /// Populate size/ownership/permissions/atime from filesystem metadata.
    #[cfg(unix)]
    pub fn apply_metadata(&mut self, meta: &std::fs::Metadata) {
        use std::os::unix::fs::MetadataExt;
        self.size = Some(meta.size());
        self.uid = Some(meta.uid());
        self.gid = Some(meta.gid());
        self.permissions = Some(meta.mode() & 0o777);
        self.access_time = Some(meta.atime());
        if meta.file_type().is_dir() {
            self.path_type = PathType::Directory;
        } else if meta.file_type().is_file() {
            self.path_type = PathType::File;
        } else if !meta.file_type().is_symlink() {
            self.path_type = PathType::NotRecognised;
        }
    }

    /// Record a retryable failure: bump the counter and append the reason.
    pub fn record_retry(&mut self, reason: impl Into<String>) {
        self.retries += 1;
        self.retry_reasons.push(reason.into());
    }

    /// Record a permanent (user-class) failure: the reason is appended and
    /// the counter saturates so no back-off is ever scheduled.
    pub fn record_permanent_failure(&mut self, reason: impl Into<String>, max_retries: u32) {
        self.retries = max_retries;
        self.retry_reasons.push(reason.into());
    }

    pub fn last_failure_reason(&self) -> Option<&str> {
        self.retry_reasons.last().map(String::as_str)
    }

    /// Attach the OBJECT_STORE location for this file under a tenancy. The
    /// bucket is the transaction id and the key is the path hash.
    pub fn set_object_store(
        &mut self,
        tenancy: &str,
        secure: bool,
        transaction_id: Uuid,
    ) -> Result<&PathLocation> {
        let scheme = if secure { "https" } else { "http" };
        self.object_name = Some(object_name(transaction_id, &self.original_path));
        self.locations.add(PathLocation {
            storage_type: StorageType::ObjectStore,
            url_scheme: scheme.to_string(),
            url_netloc: tenancy.to_string(),
            root: transaction_id.to_string(),
            path: object_key(&self.original_path),
            access_time: None,
            aggregation_id: None,
        })?;
        Ok(self.locations.get(StorageType::ObjectStore).unwrap())
    }

    /// Attach the TAPE location: `root://server/pool/tarfile`.
    pub fn set_tape(&mut self, server: &str, tape_pool: &str, tarfile: &str) -> Result<()> {
        self.locations.add(PathLocation {
            storage_type: StorageType::Tape,
            url_scheme: "root".to_string(),
            url_netloc: server.to_string(),
            root: tape_pool.to_string(),
            path: tarfile.to_string(),
            access_time: None,
            aggregation_id: None,
        })
    }

    pub fn object_store_location(&self) -> Option<&PathLocation> {
        self.locations.get(StorageType::ObjectStore)
    }

    pub fn tape_location(&self) -> Option<&PathLocation> {
        self.locations.get(StorageType::Tape)
    }

    /// The bucket holding this file's object copy.
    pub fn bucket(&self) -> Option<&str> {
        self.object_store_location().map(|l| l.root.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_is_deterministic() {
        let a = object_key("/gws/proc/file1.txt");
        let b = object_key("/gws/proc/file1.txt");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, object_key("/gws/proc/file2.txt"));
    }

    #[test]
    fn locations_reject_duplicates() {
        let mut pd = PathDetails::from_path("/a/b");
        let txid = Uuid::new_v4();
        pd.set_object_store("tenancy.example", true, txid).unwrap();
        assert!(pd.set_object_store("tenancy.example", true, txid).is_err());
        pd.set_tape("tape.example", "pool", "agg_0001.tar").unwrap();
        assert!(pd.locations.has(StorageType::Tape));
        pd.locations.remove(StorageType::Tape);
        assert!(!pd.locations.has(StorageType::Tape));
    }

    #[test]
    fn object_store_location_addresses_bucket_and_key() {
        let mut pd = PathDetails::from_path("/a/b");
        let txid = Uuid::new_v4();
        pd.set_object_store("tenancy.example", true, txid).unwrap();
        let loc = pd.object_store_location().unwrap();
        assert_eq!(loc.url_scheme, "https");
        assert_eq!(loc.root, txid.to_string());
        assert_eq!(loc.path, object_key("/a/b"));
        assert_eq!(
            pd.object_name.as_deref().unwrap(),
            format!("{txid}/{}", object_key("/a/b"))
        );
    }

    #[test]
    fn empty_path_is_recall_marker() {
        let loc = PathLocation {
            storage_type: StorageType::ObjectStore,
            url_scheme: "https".into(),
            url_netloc: "tenancy".into(),
            root: "bucket".into(),
            path: String::new(),
            access_time: None,
            aggregation_id: None,
        };
        assert!(loc.is_empty_marker());
    }

    #[test]
    fn permanent_failure_saturates_retries() {
        let mut pd = PathDetails::from_path("/a");
        pd.record_permanent_failure("file not found", 5);
        assert_eq!(pd.retries, 5);
        assert_eq!(pd.last_failure_reason(), Some("file not found"));
    }

    #[test]
    fn serde_round_trip() {
        let mut pd = PathDetails::from_path("/data/x.nc");
        pd.size = Some(42);
        pd.record_retry("object store 503");
        let json = serde_json::to_string(&pd).unwrap();
        let back: PathDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pd);
    }
}
