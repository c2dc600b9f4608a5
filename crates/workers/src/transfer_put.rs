//! Transfer-put: stream files from POSIX disk into the object store.

use async_trait::async_trait;
use bytes::BytesMut;
use nearline_core::config::TransferPutConfig;
use nearline_core::routing as rk;
use nearline_core::{details, PathDetails, RetrySchedule, State};
use nearline_fabric::{Inbound, ProcessError, Processor};
use nearline_storage::{ObjectStore, ObjectStoreProvider};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

/// Read chunk size for disk → object store streaming (8 MiB).
const READ_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Handler for the transfer-put queue.
pub struct TransferPutProcessor {
    provider: Arc<dyn ObjectStoreProvider>,
    config: TransferPutConfig,
    schedule: RetrySchedule,
}

enum PutOutcome {
    Done,
    UserError(String),
    SystemError(String),
}

impl TransferPutProcessor {
    pub fn new(
        provider: Arc<dyn ObjectStoreProvider>,
        config: TransferPutConfig,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            provider,
            config,
            schedule,
        }
    }

    async fn open_store(
        &self,
        inbound: &Inbound<'_>,
    ) -> Result<(Arc<dyn ObjectStore>, String), ProcessError> {
        let details = &inbound.message.details;
        let tenancy = details
            .tenancy
            .clone()
            .or_else(|| self.config.tenancy.clone())
            .ok_or_else(|| {
                ProcessError::Protocol("no tenancy in message or configuration".to_string())
            })?;
        let access_key = details.access_key.as_deref().unwrap_or_default();
        let secret_key = details.secret_key.as_deref().unwrap_or_default();
        let store = self
            .provider
            .open(&tenancy, access_key, secret_key)
            .await
            .map_err(|e| ProcessError::Transient(e.to_string()))?;
        Ok((store, tenancy))
    }

    /// Copy one file into its deterministic object. Replays short-circuit on
    /// an already-present object.
    async fn put_one(
        &self,
        store: &Arc<dyn ObjectStore>,
        bucket: &str,
        pd: &PathDetails,
    ) -> PutOutcome {
        let key = details::object_key(&pd.original_path);
        match store.exists(bucket, &key).await {
            Ok(true) => {
                tracing::debug!(path = %pd.original_path, "object already present, skipping");
                return PutOutcome::Done;
            }
            Ok(false) => {}
            Err(e) => return PutOutcome::SystemError(e.to_string()),
        }

        let mut file = match tokio::fs::File::open(&pd.original_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return PutOutcome::UserError("source file vanished since indexing".to_string());
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return PutOutcome::UserError("permission lost since indexing".to_string());
            }
            Err(e) => return PutOutcome::SystemError(e.to_string()),
        };

        let mut upload = match store.put_stream(bucket, &key).await {
            Ok(upload) => upload,
            Err(e) => return PutOutcome::SystemError(e.to_string()),
        };
        let mut buffer = BytesMut::with_capacity(READ_CHUNK_SIZE);
        loop {
            match file.read_buf(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(e) = upload.write(buffer.split().freeze()).await {
                        let _ = upload.abort().await;
                        return PutOutcome::SystemError(e.to_string());
                    }
                }
                Err(e) => {
                    let _ = upload.abort().await;
                    return PutOutcome::SystemError(format!("read failed: {e}"));
                }
            }
        }
        match upload.finish().await {
            Ok(_) => PutOutcome::Done,
            Err(e) => PutOutcome::SystemError(e.to_string()),
        }
    }

    async fn transfer(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let transaction_id: Uuid = message.details.transaction_id;
        let (store, tenancy) = self.open_store(inbound).await?;

        let bucket = transaction_id.to_string();
        store
            .ensure_bucket(&bucket)
            .await
            .map_err(|e| ProcessError::Transient(format!("bucket creation failed: {e}")))?;

        let secure = self.config.require_secure;
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut retry = Vec::new();
        for mut pd in message.data.filelist.clone() {
            if pd.path_type.is_link() {
                // links carry no content; the catalog row is enough to
                // recreate them on get
                let _ = pd.set_object_store(&tenancy, secure, transaction_id);
                completed.push(pd);
                continue;
            }
            match self.put_one(&store, &bucket, &pd).await {
                PutOutcome::Done => {
                    pd.set_object_store(&tenancy, secure, transaction_id)
                        .map_err(|e| ProcessError::Protocol(e.to_string()))?;
                    completed.push(pd);
                }
                PutOutcome::UserError(reason) => {
                    pd.record_permanent_failure(reason, self.schedule.max_retries());
                    failed.push(pd);
                }
                PutOutcome::SystemError(reason) => {
                    pd.record_retry(reason);
                    if self.schedule.exhausted(pd.retries) {
                        failed.push(pd);
                    } else {
                        retry.push(pd);
                    }
                }
            }
        }

        if !completed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    completed,
                    rk::TRANSFER_PUT,
                    rk::COMPLETE,
                    State::TransferPutting,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !failed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    failed,
                    rk::TRANSFER_PUT,
                    rk::FAILED,
                    State::Failed,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !retry.is_empty() {
            let delay = retry
                .iter()
                .map(|pd| self.schedule.delay_for(pd.retries))
                .max()
                .unwrap_or_default();
            tracing::warn!(
                count = retry.len(),
                delay_ms = delay.as_millis() as u64,
                "retrying transfers with back-off"
            );
            inbound
                .publisher
                .send_pathlist_delayed(
                    inbound.key,
                    message,
                    retry,
                    rk::TRANSFER_PUT,
                    rk::START,
                    State::TransferPutting,
                    delay,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for TransferPutProcessor {
    fn name(&self) -> &'static str {
        "transfer-put"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        match inbound.key.state.as_str() {
            // init re-emits as start so replicas share the upload work
            rk::INITIATE => {
                let key = inbound.key.reply(rk::TRANSFER_PUT, rk::START);
                inbound
                    .publisher
                    .publish(&key, inbound.message)
                    .map_err(|e| ProcessError::Transient(e.to_string()))
            }
            rk::START => self.transfer(&inbound).await,
            other => Err(ProcessError::Protocol(format!(
                "unknown transfer-put state: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearline_storage::FilesystemBackend;

    #[tokio::test]
    async fn put_one_streams_and_skips_replays() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp.path().join("objects"))
                .await
                .unwrap(),
        );
        let source = temp.path().join("a.txt");
        tokio::fs::write(&source, b"file body").await.unwrap();

        let processor = TransferPutProcessor::new(
            Arc::new(nearline_storage::FilesystemProvider::new(temp.path().join("objects")).await.unwrap()),
            TransferPutConfig::default(),
            RetrySchedule::default(),
        );
        let pd = PathDetails::from_path(source.to_string_lossy());
        store.ensure_bucket("bucket").await.unwrap();

        assert!(matches!(
            processor.put_one(&store, "bucket", &pd).await,
            PutOutcome::Done
        ));
        let key = details::object_key(&pd.original_path);
        assert!(store.exists("bucket", &key).await.unwrap());

        // replay: the object is already there, no error
        assert!(matches!(
            processor.put_one(&store, "bucket", &pd).await,
            PutOutcome::Done
        ));
    }

    #[tokio::test]
    async fn vanished_source_is_a_user_error() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp.path().join("objects"))
                .await
                .unwrap(),
        );
        store.ensure_bucket("bucket").await.unwrap();
        let processor = TransferPutProcessor::new(
            Arc::new(nearline_storage::FilesystemProvider::new(temp.path().join("objects")).await.unwrap()),
            TransferPutConfig::default(),
            RetrySchedule::default(),
        );
        let pd = PathDetails::from_path(temp.path().join("gone.txt").to_string_lossy());
        assert!(matches!(
            processor.put_one(&store, "bucket", &pd).await,
            PutOutcome::UserError(_)
        ));
    }
}
