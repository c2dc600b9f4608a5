//! Archive-put: bundle warm objects into tape-sized tar aggregates.

use crate::aggregations::bin_files;
use crate::tar_stream::{TarStreamWriter, CHECKSUM_ALGORITHM};
use async_trait::async_trait;
use futures::StreamExt;
use nearline_core::config::ArchivePutConfig;
use nearline_core::routing as rk;
use nearline_core::{PathDetails, RetrySchedule, State, StorageType};
use nearline_fabric::{Inbound, ProcessError, Processor};
use nearline_storage::{ObjectStore, ObjectStoreProvider, TapeStore};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Handler for the archive-put queue.
pub struct ArchivePutProcessor {
    provider: Arc<dyn ObjectStoreProvider>,
    tape: Arc<dyn TapeStore>,
    config: ArchivePutConfig,
    schedule: RetrySchedule,
}

/// Name an aggregate by hashing its member paths; stable across retries of
/// the same member set.
pub fn tarname_for(members: &[PathDetails]) -> String {
    let mut hasher = Sha256::new();
    for pd in members {
        hasher.update(pd.original_path.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{hex}.tar")
}

impl ArchivePutProcessor {
    pub fn new(
        provider: Arc<dyn ObjectStoreProvider>,
        tape: Arc<dyn TapeStore>,
        config: ArchivePutConfig,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            provider,
            tape,
            config,
            schedule,
        }
    }

    async fn open_store(&self, inbound: &Inbound<'_>) -> Result<Arc<dyn ObjectStore>, ProcessError> {
        let details = &inbound.message.details;
        let tenancy = details
            .tenancy
            .clone()
            .or_else(|| self.config.tenancy.clone())
            .ok_or_else(|| {
                ProcessError::Protocol("no tenancy in message or configuration".to_string())
            })?;
        let access_key = details
            .access_key
            .clone()
            .or_else(|| self.config.access_key.clone())
            .unwrap_or_default();
        let secret_key = details
            .secret_key
            .clone()
            .or_else(|| self.config.secret_key.clone())
            .unwrap_or_default();
        self.provider
            .open(&tenancy, &access_key, &secret_key)
            .await
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }

    /// Bin-pack the candidate set and emit one start per aggregate.
    fn split(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let filelist = inbound.message.data.filelist.clone();
        if filelist.is_empty() {
            return Ok(());
        }
        for aggregate in bin_files(filelist, self.config.max_aggregate_size) {
            let mut message = inbound.message.reply_with(aggregate);
            message.data.tarfile = Some(tarname_for(&message.data.filelist));
            let key = inbound.key.reply(rk::ARCHIVE_PUT, rk::START);
            inbound
                .publisher
                .publish(&key, &message)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
            inbound
                .publisher
                .notify_monitor(inbound.key, &message, State::ArchivePutting)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    /// Stream one aggregate's members from the object store into a tar on
    /// tape, with a rolling checksum.
    async fn write_aggregate(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let tarname = message
            .data
            .tarfile
            .clone()
            .unwrap_or_else(|| tarname_for(&message.data.filelist));
        let store = self.open_store(inbound).await?;

        // validate members up front so the tar never carries a half-written
        // entry for a missing object
        let mut members: Vec<(PathDetails, String, String, u64)> = Vec::new();
        let mut failed: Vec<PathDetails> = Vec::new();
        for mut pd in message.data.filelist.clone() {
            let Some(os_loc) = pd.object_store_location().cloned() else {
                pd.record_permanent_failure(
                    "no object store location on archive candidate",
                    self.schedule.max_retries(),
                );
                failed.push(pd);
                continue;
            };
            if os_loc.is_empty_marker() {
                pd.record_permanent_failure(
                    "archive candidate has no stored object",
                    self.schedule.max_retries(),
                );
                failed.push(pd);
                continue;
            }
            match store.head(&os_loc.root, &os_loc.path).await {
                Ok(meta) => {
                    members.push((pd, os_loc.root.clone(), os_loc.path.clone(), meta.size));
                }
                Err(e) => {
                    pd.record_retry(format!("object unavailable: {e}"));
                    if self.schedule.exhausted(pd.retries) {
                        failed.push(pd);
                    } else {
                        // the whole aggregate retries so the member set, and
                        // with it the tar name, stays stable
                        return self.retry_aggregate(inbound, e.to_string()).await;
                    }
                }
            }
        }

        let mut completed = Vec::new();
        if !members.is_empty() {
            match self.stream_members(&store, &tarname, &members).await {
                Ok(checksum) => {
                    for (mut pd, _bucket, _key, _size) in members {
                        if let Some(tape_loc) = pd.locations.get_mut(StorageType::Tape) {
                            tape_loc.path = tarname.clone();
                        } else {
                            let tape_url = self.config.tape_url.clone().unwrap_or_default();
                            let _ = pd.set_tape(&tape_url, &self.config.tape_pool, &tarname);
                        }
                        completed.push(pd);
                    }
                    let mut complete = message.reply_with(completed);
                    complete.data.tarfile = Some(tarname.clone());
                    complete.data.checksum = Some(checksum);
                    complete.data.checksum_algorithm = Some(CHECKSUM_ALGORITHM.to_string());
                    let key = inbound.key.reply(rk::ARCHIVE_PUT, rk::COMPLETE);
                    inbound
                        .publisher
                        .publish(&key, &complete)
                        .map_err(|e| ProcessError::Transient(e.to_string()))?;
                    inbound
                        .publisher
                        .notify_monitor(inbound.key, &complete, State::ArchivePutting)
                        .map_err(|e| ProcessError::Transient(e.to_string()))?;
                }
                Err(reason) => {
                    // the tape write failed: the whole aggregate fails
                    return self.retry_aggregate(inbound, reason).await;
                }
            }
        }

        if !failed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    failed,
                    rk::ARCHIVE_PUT,
                    rk::FAILED,
                    State::Failed,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn stream_members(
        &self,
        store: &Arc<dyn ObjectStore>,
        tarname: &str,
        members: &[(PathDetails, String, String, u64)],
    ) -> Result<u32, String> {
        let upload = self
            .tape
            .put_stream(tarname)
            .await
            .map_err(|e| format!("tape open failed: {e}"))?;
        let mut writer = TarStreamWriter::new(upload);

        for (pd, bucket, key, size) in members {
            let name = format!("{bucket}/{key}");
            writer
                .append_header(
                    &name,
                    *size,
                    pd.permissions.unwrap_or(0o644),
                    pd.uid.unwrap_or(0),
                    pd.gid.unwrap_or(0),
                    pd.access_time.unwrap_or(0),
                )
                .await
                .map_err(|e| format!("tape write failed: {e}"))?;

            let mut stream = match store.get_stream(bucket, key).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(format!("object read failed mid-aggregate: {e}"));
                }
            };
            let mut written: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = writer.abort().await;
                        return Err(format!("object read failed mid-aggregate: {e}"));
                    }
                };
                written += chunk.len() as u64;
                writer
                    .append_data(chunk)
                    .await
                    .map_err(|e| format!("tape write failed: {e}"))?;
            }
            if written != *size {
                let _ = writer.abort().await;
                return Err(format!(
                    "object {name} changed size mid-aggregate: wrote {written}, expected {size}"
                ));
            }
            writer
                .finish_entry(*size)
                .await
                .map_err(|e| format!("tape write failed: {e}"))?;
        }

        let (checksum, total) = writer
            .finish()
            .await
            .map_err(|e| format!("tape close failed: {e}"))?;
        tracing::info!(tarname, total_bytes = total, "aggregate written to tape");
        Ok(checksum)
    }

    /// Requeue the whole aggregate with back-off, or fail every member once
    /// attempts are exhausted.
    async fn retry_aggregate(
        &self,
        inbound: &Inbound<'_>,
        reason: String,
    ) -> Result<(), ProcessError> {
        let message = inbound.message;
        let mut filelist = message.data.filelist.clone();
        for pd in &mut filelist {
            pd.record_retry(reason.clone());
            // the counter never passes the cap, even on aggregate-wide retries
            pd.retries = pd.retries.min(self.schedule.max_retries());
        }
        let exhausted = filelist
            .iter()
            .all(|pd| self.schedule.exhausted(pd.retries));
        if exhausted {
            let mut failed = message.reply_with(filelist);
            failed.data.tarfile = message.data.tarfile.clone();
            let key = inbound.key.reply(rk::ARCHIVE_PUT, rk::FAILED);
            inbound
                .publisher
                .publish(&key, &failed)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
            inbound
                .publisher
                .notify_monitor(inbound.key, &failed, State::Failed)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
            return Ok(());
        }
        let delay = filelist
            .iter()
            .map(|pd| self.schedule.delay_for(pd.retries))
            .max()
            .unwrap_or_default();
        tracing::warn!(
            reason,
            delay_ms = delay.as_millis() as u64,
            "aggregate write failed, retrying with back-off"
        );
        let mut retry = message.reply_with(filelist);
        retry.data.tarfile = message.data.tarfile.clone();
        let key = inbound.key.reply(rk::ARCHIVE_PUT, rk::START);
        inbound
            .publisher
            .publish_delayed(&key, &retry, delay)
            .map_err(|e| ProcessError::Transient(e.to_string()))?;
        inbound
            .publisher
            .notify_monitor(inbound.key, &retry, State::ArchivePutting)
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }
}

#[async_trait]
impl Processor for ArchivePutProcessor {
    fn name(&self) -> &'static str {
        "archive-put"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        match inbound.key.state.as_str() {
            rk::INITIATE => self.split(&inbound),
            rk::START => self.write_aggregate(&inbound).await,
            other => Err(ProcessError::Protocol(format!(
                "unknown archive-put state: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tarnames_are_stable_and_distinct() {
        let a = vec![
            PathDetails::from_path("/data/a.txt"),
            PathDetails::from_path("/data/b.txt"),
        ];
        let b = vec![PathDetails::from_path("/data/c.txt")];
        assert_eq!(tarname_for(&a), tarname_for(&a));
        assert_ne!(tarname_for(&a), tarname_for(&b));
        assert!(tarname_for(&a).ends_with(".tar"));
    }
}
