//! Object-store and tape backends for the near-line data store.
//!
//! Two seams: [`ObjectStore`] (the warm tier, S3-compatible or filesystem)
//! and [`TapeStore`] (the cold tier, with the asynchronous prepare/poll
//! staging contract). Workers open object stores through an
//! [`ObjectStoreProvider`] because credentials travel in the message
//! envelope rather than the configuration.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::{FilesystemBackend, FilesystemProvider};
pub use backends::s3::{S3Backend, S3Provider};
pub use backends::tape_disk::DiskTape;
pub use error::{StorageError, StorageResult};
pub use traits::{
    ByteStream, ObjectMeta, ObjectStore, ObjectStoreProvider, PrepareStatus, StreamingUpload,
    TapeStat, TapeStore,
};

use nearline_core::config::{ObjectStoreConfig, TapeConfig};
use std::sync::Arc;
use std::time::Duration;

/// Create an object-store provider from configuration.
pub async fn provider_from_config(
    config: &ObjectStoreConfig,
    require_secure: bool,
) -> StorageResult<Arc<dyn ObjectStoreProvider>> {
    match config {
        ObjectStoreConfig::Filesystem { path } => {
            Ok(Arc::new(FilesystemProvider::new(path).await?))
        }
        ObjectStoreConfig::S3 {
            region,
            force_path_style,
            ..
        } => Ok(Arc::new(S3Provider::new(
            region.clone(),
            require_secure,
            *force_path_style,
        ))),
    }
}

/// Create a tape store from configuration.
pub async fn tape_from_config(config: &TapeConfig) -> StorageResult<Arc<dyn TapeStore>> {
    match config {
        TapeConfig::Disk {
            path,
            cache_path,
            prepare_delay_ms,
        } => Ok(Arc::new(
            DiskTape::new(path, cache_path, Duration::from_millis(*prepare_delay_ms)).await?,
        )),
    }
}
