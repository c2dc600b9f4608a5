//! Disk-emulated tape backend.
//!
//! Aggregates written here land in a "tape" directory; staging copies them
//! into a separate cache directory after an optional simulated mount delay.
//! The prepare/poll contract matches the real tape system: `request_prepare`
//! returns an id, `poll_prepare` reports pending until every aggregate in
//! the request has been copied into the cache.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, PrepareStatus, StreamingUpload, TapeStat, TapeStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const STREAM_CHUNK_SIZE: usize = 256 * 1024;

fn validate_tarfile(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(StorageError::InvalidKey(name.to_string()));
    }
    Ok(())
}

/// Disk-backed tape emulation.
pub struct DiskTape {
    tape_dir: PathBuf,
    cache_dir: PathBuf,
    prepare_delay: Duration,
    /// prepare_id → aggregates still being staged
    prepares: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl DiskTape {
    pub async fn new(
        tape_dir: impl AsRef<Path>,
        cache_dir: impl AsRef<Path>,
        prepare_delay: Duration,
    ) -> StorageResult<Self> {
        let tape_dir = tape_dir.as_ref().to_path_buf();
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&tape_dir).await?;
        fs::create_dir_all(&cache_dir).await?;
        Ok(Self {
            tape_dir,
            cache_dir,
            prepare_delay,
            prepares: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn tape_path(&self, tarfile: &str) -> StorageResult<PathBuf> {
        validate_tarfile(tarfile)?;
        Ok(self.tape_dir.join(tarfile))
    }

    fn cache_path(&self, tarfile: &str) -> StorageResult<PathBuf> {
        validate_tarfile(tarfile)?;
        Ok(self.cache_dir.join(tarfile))
    }

    /// Drop an aggregate from the staging cache, as a real tape system does
    /// under cache pressure.
    pub async fn evict_from_cache(&self, tarfile: &str) -> StorageResult<()> {
        let path = self.cache_path(tarfile)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl TapeStore for DiskTape {
    async fn stat(&self, tarfile: &str) -> StorageResult<TapeStat> {
        let on_tape = fs::try_exists(self.tape_path(tarfile)?).await?;
        let staged = fs::try_exists(self.cache_path(tarfile)?).await?;
        Ok(TapeStat { on_tape, staged })
    }

    async fn request_prepare(&self, tarfiles: &[String]) -> StorageResult<String> {
        for tarfile in tarfiles {
            let path = self.tape_path(tarfile)?;
            if !fs::try_exists(&path).await? {
                return Err(StorageError::Tape(format!("not on tape: {tarfile}")));
            }
        }

        let prepare_id = Uuid::new_v4().to_string();
        self.prepares
            .lock()
            .unwrap()
            .insert(prepare_id.clone(), tarfiles.to_vec());

        // stage each aggregate in the background after the mount delay
        for tarfile in tarfiles.to_vec() {
            let source = self.tape_path(&tarfile)?;
            let dest = self.cache_path(&tarfile)?;
            let delay = self.prepare_delay;
            let prepares = self.prepares.clone();
            let prepare_id = prepare_id.clone();
            tokio::spawn(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match fs::copy(&source, &dest).await {
                    Ok(_) => {
                        let mut prepares = prepares.lock().unwrap();
                        if let Some(pending) = prepares.get_mut(&prepare_id) {
                            pending.retain(|t| t != &tarfile);
                        }
                    }
                    Err(e) => {
                        tracing::error!(tarfile, error = %e, "staging copy failed");
                    }
                }
            });
        }

        Ok(prepare_id)
    }

    async fn poll_prepare(&self, prepare_id: &str) -> StorageResult<PrepareStatus> {
        let mut prepares = self.prepares.lock().unwrap();
        let pending = prepares
            .get(prepare_id)
            .ok_or_else(|| StorageError::UnknownPrepareId(prepare_id.to_string()))?;
        if pending.is_empty() {
            prepares.remove(prepare_id);
            Ok(PrepareStatus::Done)
        } else {
            Ok(PrepareStatus::Pending)
        }
    }

    async fn get_stream(&self, tarfile: &str) -> StorageResult<ByteStream> {
        // prefer the staged copy; fall back to the tape copy
        let cache = self.cache_path(tarfile)?;
        let path = if fs::try_exists(&cache).await? {
            cache
        } else {
            self.tape_path(tarfile)?
        };
        let file = fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(tarfile.to_string()),
            _ => StorageError::Io(e),
        })?;
        use futures::StreamExt;
        let stream = ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE);
        Ok(Box::pin(stream.map(|r| r.map_err(StorageError::Io))))
    }

    async fn put_stream(&self, tarfile: &str) -> StorageResult<Box<dyn StreamingUpload>> {
        let final_path = self.tape_path(tarfile)?;
        let temp_path = self.tape_dir.join(format!(".write-{}", Uuid::new_v4()));
        let file = fs::File::create(&temp_path).await?;
        Ok(Box::new(DiskTapeWrite {
            file: Some(file),
            temp_path,
            final_path,
            bytes_written: 0,
        }))
    }

    async fn delete(&self, tarfile: &str) -> StorageResult<()> {
        let _ = fs::remove_file(self.cache_path(tarfile)?).await;
        fs::remove_file(self.tape_path(tarfile)?)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::NotFound(tarfile.to_string()),
                _ => StorageError::Io(e),
            })
    }

    fn backend_name(&self) -> &'static str {
        "disk-tape"
    }
}

struct DiskTapeWrite {
    file: Option<fs::File>,
    temp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

#[async_trait]
impl StreamingUpload for DiskTapeWrite {
    async fn write(&mut self, data: Bytes) -> StorageResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StorageError::Io(std::io::Error::other("write already closed")))?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn write_aggregate(tape: &DiskTape, name: &str, body: &[u8]) {
        let mut upload = tape.put_stream(name).await.unwrap();
        upload.write(Bytes::copy_from_slice(body)).await.unwrap();
        Box::new(upload).finish().await.unwrap();
    }

    #[tokio::test]
    async fn stat_reflects_tape_and_cache() {
        let temp = tempfile::tempdir().unwrap();
        let tape = DiskTape::new(
            temp.path().join("tape"),
            temp.path().join("cache"),
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(
            tape.stat("agg.tar").await.unwrap(),
            TapeStat {
                on_tape: false,
                staged: false
            }
        );

        write_aggregate(&tape, "agg.tar", b"aggregate body").await;
        let stat = tape.stat("agg.tar").await.unwrap();
        assert!(stat.on_tape && !stat.staged);
    }

    #[tokio::test]
    async fn prepare_then_poll_until_done() {
        let temp = tempfile::tempdir().unwrap();
        let tape = DiskTape::new(
            temp.path().join("tape"),
            temp.path().join("cache"),
            Duration::from_millis(30),
        )
        .await
        .unwrap();
        write_aggregate(&tape, "agg.tar", b"aggregate body").await;

        let prepare_id = tape
            .request_prepare(&["agg.tar".to_string()])
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match tape.poll_prepare(&prepare_id).await.unwrap() {
                PrepareStatus::Done => break,
                PrepareStatus::Pending => {
                    assert!(tokio::time::Instant::now() < deadline, "prepare never completed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        assert!(tape.stat("agg.tar").await.unwrap().staged);
    }

    #[tokio::test]
    async fn prepare_of_missing_aggregate_fails() {
        let temp = tempfile::tempdir().unwrap();
        let tape = DiskTape::new(
            temp.path().join("tape"),
            temp.path().join("cache"),
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert!(tape.request_prepare(&["nope.tar".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn unknown_prepare_id_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let tape = DiskTape::new(
            temp.path().join("tape"),
            temp.path().join("cache"),
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert!(matches!(
            tape.poll_prepare("bogus").await,
            Err(StorageError::UnknownPrepareId(_))
        ));
    }

    #[tokio::test]
    async fn get_stream_reads_back_the_aggregate() {
        let temp = tempfile::tempdir().unwrap();
        let tape = DiskTape::new(
            temp.path().join("tape"),
            temp.path().join("cache"),
            Duration::ZERO,
        )
        .await
        .unwrap();
        write_aggregate(&tape, "agg.tar", b"aggregate body").await;

        let mut stream = tape.get_stream("agg.tar").await.unwrap();
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(out, b"aggregate body");
    }
}
