//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
}

/// Object store abstraction over one tenancy.
///
/// Buckets are named by transaction id; keys are the deterministic path
/// hashes. Both backends stream bodies chunk-wise so multi-hundred-gigabyte
/// files never materialise in memory.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Create the bucket if it does not exist.
    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()>;

    /// Check if an object exists.
    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool>;

    /// Get an object's size without fetching content.
    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object as a byte stream.
    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream>;

    /// Start a streaming upload.
    async fn put_stream(&self, bucket: &str, key: &str)
        -> StorageResult<Box<dyn StreamingUpload>>;

    /// Delete an object.
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// List object keys under a prefix.
    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>>;

    /// Static identifier for logging.
    fn backend_name(&self) -> &'static str;

    /// Verify backend connectivity.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Trait for streaming uploads.
#[async_trait]
pub trait StreamingUpload: Send {
    /// Write a chunk of data.
    async fn write(&mut self, data: Bytes) -> StorageResult<()>;

    /// Finish the upload and return the total bytes written.
    async fn finish(self: Box<Self>) -> StorageResult<u64>;

    /// Abort the upload.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

/// Opens an object store for the credentials a message carries. Transfer and
/// archive workers receive per-message access keys, so the store cannot be a
/// single client constructed at startup.
#[async_trait]
pub trait ObjectStoreProvider: Send + Sync + 'static {
    async fn open(
        &self,
        tenancy: &str,
        access_key: &str,
        secret_key: &str,
    ) -> StorageResult<Arc<dyn ObjectStore>>;
}

/// What tape knows about an aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapeStat {
    pub on_tape: bool,
    /// Staged into the tape system's own cache, so reads are cheap.
    pub staged: bool,
}

/// Outcome of polling a prepare request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareStatus {
    Done,
    Pending,
}

/// Tape abstraction: aggregate-granularity streams plus the asynchronous
/// prepare/poll staging interface.
#[async_trait]
pub trait TapeStore: Send + Sync + 'static {
    async fn stat(&self, tarfile: &str) -> StorageResult<TapeStat>;

    /// Ask tape to stage a set of aggregates; returns the tape-issued
    /// prepare id to poll with.
    async fn request_prepare(&self, tarfiles: &[String]) -> StorageResult<String>;

    async fn poll_prepare(&self, prepare_id: &str) -> StorageResult<PrepareStatus>;

    /// Stream an aggregate off tape. The aggregate should be staged first.
    async fn get_stream(&self, tarfile: &str) -> StorageResult<ByteStream>;

    /// Stream an aggregate onto tape.
    async fn put_stream(&self, tarfile: &str) -> StorageResult<Box<dyn StreamingUpload>>;

    async fn delete(&self, tarfile: &str) -> StorageResult<()>;

    fn backend_name(&self) -> &'static str;
}
