//! Configuration types shared across crates.
//!
//! One struct per stage queue plus the fabric, general retry policy, storage
//! endpoints and the RPC publisher, mirroring the recognised option groups.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retries::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAYS_SECS};
use crate::{DEFAULT_FILELIST_MAX_LENGTH, DEFAULT_MAX_FILESIZE, DEFAULT_MESSAGE_THRESHOLD};

/// Message fabric configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Name of the single topic exchange.
    #[serde(default = "default_exchange_name")]
    pub exchange: String,
    /// Application segment used for keys originated by this deployment.
    #[serde(default = "default_application")]
    pub application: String,
    /// Per-queue prefetch limit: unacked deliveries per consumer.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

fn default_exchange_name() -> String {
    "nearline".to_string()
}

fn default_application() -> String {
    crate::routing::ROOT.to_string()
}

fn default_prefetch() -> usize {
    1
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange_name(),
            application: default_application(),
            prefetch: default_prefetch(),
        }
    }
}

/// Retry policy shared by every stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Back-off table in seconds, indexed by the per-file retry counter.
    #[serde(default = "default_retry_delays")]
    pub retry_delays: Vec<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_retry_delays() -> Vec<u64> {
    DEFAULT_RETRY_DELAYS_SECS.to_vec()
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            retry_delays: default_retry_delays(),
            max_retries: default_max_retries(),
        }
    }
}

impl GeneralConfig {
    pub fn schedule(&self) -> crate::RetrySchedule {
        crate::RetrySchedule::new(&self.retry_delays, self.max_retries)
    }

    /// Reject a decreasing back-off table.
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_delays.windows(2).any(|w| w[0] > w[1]) {
            return Err("general.retry_delays must be non-decreasing".to_string());
        }
        Ok(())
    }
}

/// Object store endpoint configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    /// Local filesystem emulation (development and tests).
    Filesystem {
        /// Root directory; buckets become sub-directories.
        path: PathBuf,
    },
    /// S3-compatible tenancy reached over HTTP(S).
    S3 {
        /// Tenancy endpoint, e.g. "https://tenancy.example:443".
        endpoint: String,
        region: Option<String>,
        /// Force path-style URLs (`endpoint/bucket/key`); required for most
        /// non-AWS tenancies.
        #[serde(default = "default_force_path_style")]
        force_path_style: bool,
    },
}

fn default_force_path_style() -> bool {
    true
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/objects"),
        }
    }
}

/// Tape endpoint configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TapeConfig {
    /// Disk-backed tape emulation with an explicit staging cache.
    Disk {
        /// Directory holding the "on tape" copies.
        path: PathBuf,
        /// Directory holding staged (prepared) copies.
        cache_path: PathBuf,
        /// Simulated prepare latency in milliseconds.
        #[serde(default)]
        prepare_delay_ms: u64,
    },
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self::Disk {
            path: PathBuf::from("./data/tape"),
            cache_path: PathBuf::from("./data/tape-cache"),
            prepare_delay_ms: 0,
        }
    }
}

/// Database engine configuration for the catalog and monitor stores.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum DbConfig {
    /// SQLite database (development and tests).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database (production).
    Postgres {
        /// Connection URL.
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

impl DbConfig {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::Sqlite { path: path.into() }
    }
}

/// Indexer configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Maximum paths per sub-transaction / emitted batch.
    #[serde(default = "default_filelist_max_length")]
    pub filelist_max_length: usize,
    /// Cumulative byte threshold at which a batch is emitted mid-walk.
    #[serde(default = "default_message_threshold")]
    pub message_threshold: u64,
    /// Verify read access as the requesting user.
    #[serde(default = "default_true")]
    pub check_permissions: bool,
    /// Enforce the per-file size ceiling.
    #[serde(default = "default_true")]
    pub check_filesize: bool,
    /// Per-file ceiling in bytes, set by the tape cache size.
    #[serde(default = "default_max_filesize")]
    pub max_filesize: u64,
}

fn default_filelist_max_length() -> usize {
    DEFAULT_FILELIST_MAX_LENGTH
}

fn default_message_threshold() -> u64 {
    DEFAULT_MESSAGE_THRESHOLD
}

fn default_max_filesize() -> u64 {
    DEFAULT_MAX_FILESIZE
}

fn default_true() -> bool {
    true
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            filelist_max_length: default_filelist_max_length(),
            message_threshold: default_message_threshold(),
            check_permissions: true,
            check_filesize: true,
            max_filesize: default_max_filesize(),
        }
    }
}

/// Catalog worker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub db: DbConfig,
    /// Tenancy applied when a put does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tenancy: Option<String>,
    /// Tape server applied to archive candidates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tape_url: Option<String>,
    /// Recall whole aggregations rather than only the requested members.
    #[serde(default = "default_true")]
    pub full_unpack: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            db: DbConfig::sqlite("./data/catalog.db"),
            default_tenancy: None,
            default_tape_url: None,
            full_unpack: true,
        }
    }
}

/// Transfer-put configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferPutConfig {
    /// Tenancy applied when the message does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,
    /// Verify TLS certificates against the tenancy endpoint.
    #[serde(default = "default_true")]
    pub require_secure: bool,
}

impl Default for TransferPutConfig {
    fn default() -> Self {
        Self {
            tenancy: None,
            require_secure: true,
        }
    }
}

/// Transfer-get configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferGetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,
    #[serde(default = "default_true")]
    pub require_secure: bool,
    /// Restore file ownership after download.
    #[serde(default)]
    pub chown: bool,
    /// Privileged helper executable used when the worker itself cannot chown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chown_command: Option<String>,
    /// Oversized inputs are re-chunked into sublists of this length.
    #[serde(default = "default_filelist_max_length")]
    pub filelist_max_length: usize,
}

impl Default for TransferGetConfig {
    fn default() -> Self {
        Self {
            tenancy: None,
            require_secure: true,
            chown: false,
            chown_command: None,
            filelist_max_length: default_filelist_max_length(),
        }
    }
}

/// Archive-put configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivePutConfig {
    /// Tape server netloc, e.g. "tape.example".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tape_url: Option<String>,
    /// Object-store credentials used by the out-of-band archive trigger,
    /// which has no user request to take them from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    /// Tape pool path forming the root of aggregate URLs.
    #[serde(default = "default_tape_pool")]
    pub tape_pool: String,
    /// Streaming chunk size in bytes; constrained below by the object-store
    /// multipart minimum.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Upper bound on a single aggregate.
    #[serde(default = "default_max_aggregate_size")]
    pub max_aggregate_size: u64,
    /// Interval for the out-of-band catalog-archive-next trigger; absent
    /// disables the trigger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_interval_secs: Option<u64>,
}

fn default_tape_pool() -> String {
    "nearline".to_string()
}

fn default_chunk_size() -> usize {
    5 * 1024 * 1024
}

fn default_max_aggregate_size() -> u64 {
    5 * 1024 * 1024 * 1024
}

impl Default for ArchivePutConfig {
    fn default() -> Self {
        Self {
            tape_url: None,
            tenancy: None,
            access_key: None,
            secret_key: None,
            tape_pool: default_tape_pool(),
            chunk_size: default_chunk_size(),
            max_aggregate_size: default_max_aggregate_size(),
            trigger_interval_secs: None,
        }
    }
}

/// Archive-get configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveGetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tape_url: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Verify the aggregate's ADLER32 against the catalog during recall.
    #[serde(default = "default_true")]
    pub query_checksum: bool,
    /// Delay before a prepare-check poll, in milliseconds.
    #[serde(default = "default_prepare_requeue")]
    pub prepare_requeue_ms: u64,
}

fn default_prepare_requeue() -> u64 {
    30_000
}

impl Default for ArchiveGetConfig {
    fn default() -> Self {
        Self {
            tape_url: None,
            chunk_size: default_chunk_size(),
            query_checksum: true,
            prepare_requeue_ms: default_prepare_requeue(),
        }
    }
}

impl ArchiveGetConfig {
    pub fn prepare_requeue(&self) -> Duration {
        Duration::from_millis(self.prepare_requeue_ms)
    }
}

/// Monitor worker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub db: DbConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db: DbConfig::sqlite("./data/monitor.db"),
        }
    }
}

/// Logging worker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory receiving the per-worker log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Rotate a file once it exceeds this size.
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    /// Rotated generations kept per file.
    #[serde(default = "default_backup_count")]
    pub backup_count: u32,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_log_max_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_backup_count() -> u32 {
    5
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            max_bytes: default_log_max_bytes(),
            backup_count: default_backup_count(),
        }
    }
}

/// RPC publisher configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Seconds a caller blocks awaiting the reply.
    #[serde(default = "default_rpc_time_limit")]
    pub time_limit_secs: u64,
    /// Declare reply queues exclusive to the calling connection.
    #[serde(default = "default_true")]
    pub queue_exclusivity: bool,
}

fn default_rpc_time_limit() -> u64 {
    30
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: default_rpc_time_limit(),
            queue_exclusivity: default_true(),
        }
    }
}

impl RpcConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }
}

/// Authentication backend selection. The JASMIN-specific implementation
/// lives outside this workspace; the permissive backend grants every group
/// membership and reports the "user" role.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_backend")]
    pub backend: String,
}

fn default_auth_backend() -> String {
    "permissive".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: default_auth_backend(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub authentication: AuthConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub tape: TapeConfig,
    #[serde(default)]
    pub index_q: IndexConfig,
    #[serde(default)]
    pub catalog_q: CatalogConfig,
    #[serde(default)]
    pub transfer_put_q: TransferPutConfig,
    #[serde(default)]
    pub transfer_get_q: TransferGetConfig,
    #[serde(default)]
    pub archive_put_q: ArchivePutConfig,
    #[serde(default)]
    pub archive_get_q: ArchiveGetConfig,
    #[serde(default)]
    pub monitor_q: MonitorConfig,
    #[serde(default)]
    pub logging_q: LoggingConfig,
    #[serde(default)]
    pub rpc_publisher: RpcConfig,
}

impl AppConfig {
    /// A configuration rooted in a scratch directory.
    ///
    /// **For testing only.** Filesystem object store, disk tape, SQLite
    /// stores, immediate retries.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            object_store: ObjectStoreConfig::Filesystem {
                path: root.join("objects"),
            },
            tape: TapeConfig::Disk {
                path: root.join("tape"),
                cache_path: root.join("tape-cache"),
                prepare_delay_ms: 0,
            },
            catalog_q: CatalogConfig {
                db: DbConfig::sqlite(root.join("catalog.db")),
                ..CatalogConfig::default()
            },
            monitor_q: MonitorConfig {
                db: DbConfig::sqlite(root.join("monitor.db")),
            },
            logging_q: LoggingConfig {
                log_dir: root.join("logs"),
                ..LoggingConfig::default()
            },
            general: GeneralConfig {
                retry_delays: vec![0, 0, 0],
                max_retries: 3,
            },
            ..Self::default()
        }
    }

    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), String> {
        self.general.validate()?;
        if self.fabric.prefetch == 0 {
            return Err("fabric.prefetch must be at least 1".to_string());
        }
        if self.index_q.filelist_max_length == 0 {
            return Err("index_q.filelist_max_length must be at least 1".to_string());
        }
        if self.archive_put_q.chunk_size == 0 {
            return Err("archive_put_q.chunk_size must be non-zero".to_string());
        }
        Ok(())
    }
}
