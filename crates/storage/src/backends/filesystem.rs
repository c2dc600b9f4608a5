//! Local filesystem object store for development and tests.
//!
//! Buckets become directories under the root; object keys become files
//! within them, with uploads staged through a temp name so readers never see
//! a partial object.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore, ObjectStoreProvider, StreamingUpload};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

fn validate_segment(segment: &str) -> StorageResult<()> {
    if segment.is_empty()
        || segment.contains("..")
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(StorageError::InvalidKey(segment.to_string()));
    }
    Ok(())
}

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn bucket_path(&self, bucket: &str) -> StorageResult<PathBuf> {
        validate_segment(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        validate_segment(key)?;
        Ok(self.bucket_path(bucket)?.join(key))
    }
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    async fn ensure_bucket(&self, bucket: &str) -> StorageResult<()> {
        fs::create_dir_all(self.bucket_path(bucket)?).await?;
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        Ok(fs::try_exists(self.object_path(bucket, key)?).await?)
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(bucket, key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
                _ => StorageError::Io(e),
            })?;
        let last_modified = meta
            .modified()
            .ok()
            .map(time::OffsetDateTime::from);
        Ok(ObjectMeta {
            size: meta.len(),
            last_modified,
        })
    }

    async fn get_stream(&self, bucket: &str, key: &str) -> StorageResult<ByteStream> {
        let path = self.object_path(bucket, key)?;
        let file = fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io(e),
        })?;
        let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);
        use futures::StreamExt;
        Ok(Box::pin(stream.map(|r| r.map_err(StorageError::Io))))
    }

    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
    ) -> StorageResult<Box<dyn StreamingUpload>> {
        let final_path = self.object_path(bucket, key)?;
        let bucket_path = self.bucket_path(bucket)?;
        if !fs::try_exists(&bucket_path).await? {
            return Err(StorageError::BucketNotFound(bucket.to_string()));
        }
        let temp_path = bucket_path.join(format!(".upload-{}", Uuid::new_v4()));
        let file = fs::File::create(&temp_path).await?;
        Ok(Box::new(FilesystemUpload {
            file: Some(file),
            temp_path,
            final_path,
            bytes_written: 0,
        }))
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        fs::remove_file(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io(e),
        })
    }

    async fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let bucket_path = self.bucket_path(bucket)?;
        let mut results = Vec::new();
        let mut entries = match fs::read_dir(&bucket_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(e) => return Err(StorageError::Io(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".upload-") {
                continue;
            }
            if name.starts_with(prefix) {
                results.push(name);
            }
        }
        results.sort();
        Ok(results)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// Streaming upload writing through a temp file renamed on finish.
struct FilesystemUpload {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for FilesystemUpload {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("upload already closed")))?;
        file.write_all(&data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<u64> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.temp_path, &self.final_path).await?;
        Ok(self.bytes_written)
    }

    async fn abort(mut self: Box<Self>) -> StorageResult<()> {
        self.file.take();
        let _ = fs::remove_file(&self.temp_path).await;
        Ok(())
    }
}

/// Provider returning one shared filesystem backend regardless of the
/// credentials on the message.
pub struct FilesystemProvider {
    backend: Arc<FilesystemBackend>,
}

impl FilesystemProvider {
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        Ok(Self {
            backend: Arc::new(FilesystemBackend::new(root).await?),
        })
    }
}

#[async_trait]
impl ObjectStoreProvider for FilesystemProvider {
    async fn open(
        &self,
        _tenancy: &str,
        _access_key: &str,
        _secret_key: &str,
    ) -> StorageResult<Arc<dyn ObjectStore>> {
        Ok(self.backend.clone())
    }
}
