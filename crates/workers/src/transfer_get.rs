//! Transfer-get: stream objects back onto POSIX disk, restoring ownership,
//! permissions and symlinks.

use crate::chown::Chowner;
use async_trait::async_trait;
use futures::StreamExt;
use nearline_core::config::TransferGetConfig;
use nearline_core::routing as rk;
use nearline_core::{PathDetails, RetrySchedule, State, StorageType};
use nearline_fabric::{Inbound, ProcessError, Processor};
use nearline_storage::{ObjectStore, ObjectStoreProvider, StorageError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Handler for the transfer-get queue.
pub struct TransferGetProcessor {
    provider: Arc<dyn ObjectStoreProvider>,
    config: TransferGetConfig,
    schedule: RetrySchedule,
    chowner: Arc<dyn Chowner>,
}

enum GetOutcome {
    Done,
    UserError(String),
    SystemError(String),
}

impl TransferGetProcessor {
    pub fn new(
        provider: Arc<dyn ObjectStoreProvider>,
        config: TransferGetConfig,
        schedule: RetrySchedule,
        chowner: Arc<dyn Chowner>,
    ) -> Self {
        Self {
            provider,
            config,
            schedule,
            chowner,
        }
    }

    /// Chunk an oversized input into sublists and re-emit each as a start.
    fn chunk(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let filelist = &inbound.message.data.filelist;
        if filelist.is_empty() {
            return inbound
                .publisher
                .notify_monitor(inbound.key, inbound.message, State::Complete)
                .map_err(|e| ProcessError::Transient(e.to_string()));
        }
        for chunk in filelist.chunks(self.config.filelist_max_length) {
            let part = inbound.message.reply_with(chunk.to_vec());
            let key = inbound.key.reply(rk::TRANSFER_GET, rk::START);
            inbound
                .publisher
                .publish(&key, &part)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    /// The destination path: `target/original_path`.
    fn destination(target: &Path, original_path: &str) -> PathBuf {
        let relative = original_path.trim_start_matches('/');
        target.join(relative)
    }

    async fn get_one(
        &self,
        store: &Arc<dyn ObjectStore>,
        target: &Path,
        pd: &PathDetails,
    ) -> GetOutcome {
        let dest = Self::destination(target, &pd.original_path);
        if let Some(parent) = dest.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return GetOutcome::SystemError(format!("mkdir failed: {e}"));
            }
        }

        if pd.path_type.is_link() {
            let Some(link_target) = &pd.link_target else {
                return GetOutcome::UserError("link has no recorded target".to_string());
            };
            let _ = tokio::fs::remove_file(&dest).await;
            return match tokio::fs::symlink(link_target, &dest).await {
                Ok(()) => GetOutcome::Done,
                Err(e) => GetOutcome::SystemError(format!("symlink failed: {e}")),
            };
        }

        let Some(location) = pd.locations.get(StorageType::ObjectStore) else {
            return GetOutcome::UserError("no object store location".to_string());
        };
        if location.is_empty_marker() {
            return GetOutcome::UserError("object store location is empty".to_string());
        }

        let mut stream = match store.get_stream(&location.root, &location.path).await {
            Ok(stream) => stream,
            Err(StorageError::NotFound(_)) => {
                return GetOutcome::UserError("object missing from store".to_string());
            }
            Err(e) => return GetOutcome::SystemError(e.to_string()),
        };

        // write through a temp name so a crashed transfer never leaves a
        // half-written file at the destination
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = dest.with_file_name(format!(".{file_name}.partial-{}", uuid::Uuid::new_v4()));
        let mut file = match tokio::fs::File::create(&temp).await {
            Ok(file) => file,
            Err(e) => return GetOutcome::SystemError(format!("create failed: {e}")),
        };
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&temp).await;
                    return GetOutcome::SystemError(e.to_string());
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                let _ = tokio::fs::remove_file(&temp).await;
                return GetOutcome::SystemError(format!("write failed: {e}"));
            }
        }
        if let Err(e) = file.flush().await {
            return GetOutcome::SystemError(format!("flush failed: {e}"));
        }
        drop(file);
        if let Err(e) = tokio::fs::rename(&temp, &dest).await {
            return GetOutcome::SystemError(format!("rename failed: {e}"));
        }

        if let Some(mode) = pd.permissions {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode);
            if let Err(e) = tokio::fs::set_permissions(&dest, perms).await {
                return GetOutcome::SystemError(format!("chmod failed: {e}"));
            }
        }
        if self.config.chown {
            if let (Some(uid), Some(gid)) = (pd.uid, pd.gid) {
                if let Err(e) = self.chowner.chown(&dest, uid, gid).await {
                    return GetOutcome::SystemError(format!("chown failed: {e}"));
                }
            }
        }
        GetOutcome::Done
    }

    async fn transfer(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        let target = details
            .target
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| ProcessError::Protocol("get carries no target directory".to_string()))?;
        let tenancy = details
            .tenancy
            .clone()
            .or_else(|| self.config.tenancy.clone())
            .ok_or_else(|| {
                ProcessError::Protocol("no tenancy in message or configuration".to_string())
            })?;
        let store = self
            .provider
            .open(
                &tenancy,
                details.access_key.as_deref().unwrap_or_default(),
                details.secret_key.as_deref().unwrap_or_default(),
            )
            .await
            .map_err(|e| ProcessError::Transient(e.to_string()))?;

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut retry = Vec::new();
        for mut pd in message.data.filelist.clone() {
            match self.get_one(&store, &target, &pd).await {
                GetOutcome::Done => completed.push(pd),
                GetOutcome::UserError(reason) => {
                    pd.record_permanent_failure(reason, self.schedule.max_retries());
                    failed.push(pd);
                }
                GetOutcome::SystemError(reason) => {
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
                    rk::TRANSFER_GET,
                    rk::COMPLETE,
                    State::TransferGetting,
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
                    rk::TRANSFER_GET,
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
            inbound
                .publisher
                .send_pathlist_delayed(
                    inbound.key,
                    message,
                    retry,
                    rk::TRANSFER_GET,
                    rk::START,
                    State::TransferGetting,
                    delay,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for TransferGetProcessor {
    fn name(&self) -> &'static str {
        "transfer-get"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        match inbound.key.state.as_str() {
            rk::INITIATE => self.chunk(&inbound),
            rk::START => {
                if inbound.message.data.filelist.len() > self.config.filelist_max_length {
                    self.chunk(&inbound)
                } else {
                    self.transfer(&inbound).await
                }
            }
            other => Err(ProcessError::Protocol(format!(
                "unknown transfer-get state: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chown::NoChown;
    use nearline_storage::{FilesystemBackend, FilesystemProvider};
    use uuid::Uuid;

    async fn processor(root: &Path) -> (TransferGetProcessor, Arc<dyn ObjectStore>) {
        let store: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(root.join("objects")).await.unwrap(),
        );
        let processor = TransferGetProcessor::new(
            Arc::new(FilesystemProvider::new(root.join("objects")).await.unwrap()),
            TransferGetConfig::default(),
            RetrySchedule::default(),
            Arc::new(NoChown),
        );
        (processor, store)
    }

    #[tokio::test]
    async fn get_one_restores_content_and_mode() {
        let temp = tempfile::tempdir().unwrap();
        let (processor, store) = processor(temp.path()).await;
        let txid = Uuid::new_v4();
        let bucket = txid.to_string();
        store.ensure_bucket(&bucket).await.unwrap();

        // seed the object under its deterministic name
        let mut pd = PathDetails::from_path("/data/a.txt");
        pd.permissions = Some(0o640);
        pd.set_object_store("tenancy", true, txid).unwrap();
        let loc = pd.locations.get(StorageType::ObjectStore).unwrap().clone();
        let mut upload = store.put_stream(&loc.root, &loc.path).await.unwrap();
        upload
            .write(bytes::Bytes::from_static(b"restored body"))
            .await
            .unwrap();
        Box::new(upload).finish().await.unwrap();

        let target = temp.path().join("restore");
        assert!(matches!(
            processor.get_one(&store, &target, &pd).await,
            GetOutcome::Done
        ));

        let dest = target.join("data/a.txt");
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"restored body");
        use std::os::unix::fs::PermissionsExt;
        let mode = tokio::fs::metadata(&dest).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[tokio::test]
    async fn get_one_recreates_symlinks_without_download() {
        let temp = tempfile::tempdir().unwrap();
        let (processor, store) = processor(temp.path()).await;

        let mut pd = PathDetails::from_path("/data/link");
        pd.path_type = nearline_core::PathType::LinkCommon;
        pd.link_target = Some("a.txt".to_string());

        let target = temp.path().join("restore");
        assert!(matches!(
            processor.get_one(&store, &target, &pd).await,
            GetOutcome::Done
        ));
        let dest = target.join("data/link");
        let read = tokio::fs::read_link(&dest).await.unwrap();
        assert_eq!(read, PathBuf::from("a.txt"));
    }

    #[tokio::test]
    async fn missing_object_is_a_user_error() {
        let temp = tempfile::tempdir().unwrap();
        let (processor, store) = processor(temp.path()).await;
        let txid = Uuid::new_v4();
        store.ensure_bucket(&txid.to_string()).await.unwrap();

        let mut pd = PathDetails::from_path("/data/a.txt");
        pd.set_object_store("tenancy", true, txid).unwrap();
        let target = temp.path().join("restore");
        assert!(matches!(
            processor.get_one(&store, &target, &pd).await,
            GetOutcome::UserError(_)
        ));
    }
}
