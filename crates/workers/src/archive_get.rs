//! Archive-get: the prepare / poll / stream recall of tape aggregates.
//!
//! Tape retrieval is asynchronous: an aggregate must be staged into the tape
//! system's cache before random reads are cheap. The worker runs a
//! three-state machine — `prepare` issues the staging request, delayed
//! `prepare-check` messages poll it, and `start` streams the tar back,
//! extracting members into their waiting object-store locations.

use crate::tar_stream::TarStreamReader;
use async_trait::async_trait;
use nearline_core::details::object_key;
use nearline_core::routing as rk;
use nearline_core::{PathDetails, RetrySchedule, State, StorageType};
use nearline_fabric::{Inbound, ProcessError, Processor};
use nearline_storage::{
    ObjectStore, ObjectStoreProvider, PrepareStatus, StorageError, TapeStore,
};
use nearline_core::config::ArchiveGetConfig;
use std::sync::Arc;

/// Handler for the archive-get queue.
pub struct ArchiveGetProcessor {
    provider: Arc<dyn ObjectStoreProvider>,
    tape: Arc<dyn TapeStore>,
    config: ArchiveGetConfig,
    schedule: RetrySchedule,
}

impl ArchiveGetProcessor {
    pub fn new(
        provider: Arc<dyn ObjectStoreProvider>,
        tape: Arc<dyn TapeStore>,
        config: ArchiveGetConfig,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            provider,
            tape,
            config,
            schedule,
        }
    }

    fn tarfile(inbound: &Inbound<'_>) -> Result<String, ProcessError> {
        inbound
            .message
            .data
            .tarfile
            .clone()
            .ok_or_else(|| ProcessError::Protocol("recall carries no tarfile".to_string()))
    }

    async fn open_store(&self, inbound: &Inbound<'_>) -> Result<Arc<dyn ObjectStore>, ProcessError> {
        let details = &inbound.message.details;
        let tenancy = details
            .tenancy
            .clone()
            .ok_or_else(|| ProcessError::Protocol("recall carries no tenancy".to_string()))?;
        self.provider
            .open(
                &tenancy,
                details.access_key.as_deref().unwrap_or_default(),
                details.secret_key.as_deref().unwrap_or_default(),
            )
            .await
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }

    /// Ask tape to stage the aggregate, unless it already is.
    async fn prepare(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let tarfile = Self::tarfile(inbound)?;
        let stat = self
            .tape
            .stat(&tarfile)
            .await
            .map_err(|e| ProcessError::Transient(e.to_string()))?;
        if !stat.on_tape {
            return self
                .fail_all(inbound, format!("aggregate {tarfile} is not on tape"))
                .await;
        }
        if stat.staged {
            let key = inbound.key.reply(rk::ARCHIVE_GET, rk::START);
            return inbound
                .publisher
                .publish(&key, inbound.message)
                .map_err(|e| ProcessError::Transient(e.to_string()));
        }

        let prepare_id = self
            .tape
            .request_prepare(std::slice::from_ref(&tarfile))
            .await
            .map_err(|e| ProcessError::Transient(e.to_string()))?;
        tracing::info!(tarfile, prepare_id, "tape prepare requested");

        let mut check = inbound.message.clone();
        check.data.prepare_id = Some(prepare_id);
        let key = inbound.key.reply(rk::ARCHIVE_GET, rk::PREPARE_CHECK);
        inbound
            .publisher
            .publish_delayed(&key, &check, self.config.prepare_requeue())
            .map_err(|e| ProcessError::Transient(e.to_string()))?;
        inbound
            .publisher
            .notify_monitor(inbound.key, &check, State::ArchiveGetting)
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }

    /// Poll the staging request; ready aggregates move to `start`, pending
    /// ones re-delay.
    async fn prepare_check(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let prepare_id = inbound
            .message
            .data
            .prepare_id
            .clone()
            .ok_or_else(|| ProcessError::Protocol("prepare-check carries no prepare id".to_string()))?;

        match self.tape.poll_prepare(&prepare_id).await {
            Ok(PrepareStatus::Done) => {
                let mut ready = inbound.message.clone();
                ready.data.prepare_id = None;
                let key = inbound.key.reply(rk::ARCHIVE_GET, rk::START);
                inbound
                    .publisher
                    .publish(&key, &ready)
                    .map_err(|e| ProcessError::Transient(e.to_string()))
            }
            Ok(PrepareStatus::Pending) => {
                let key = inbound.key.reply(rk::ARCHIVE_GET, rk::PREPARE_CHECK);
                inbound
                    .publisher
                    .publish_delayed(&key, inbound.message, self.config.prepare_requeue())
                    .map_err(|e| ProcessError::Transient(e.to_string()))
            }
            Err(StorageError::UnknownPrepareId(_)) => {
                // the tape system lost the request (restart); start over
                tracing::warn!(prepare_id, "prepare id unknown, reissuing prepare");
                let mut again = inbound.message.clone();
                again.data.prepare_id = None;
                let key = inbound.key.reply(rk::ARCHIVE_GET, rk::PREPARE);
                inbound
                    .publisher
                    .publish(&key, &again)
                    .map_err(|e| ProcessError::Transient(e.to_string()))
            }
            Err(e) => Err(ProcessError::Transient(e.to_string())),
        }
    }

    /// Stream the staged tar off tape, extract each wanted member and upload
    /// it into its waiting object-store location.
    async fn extract(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let tarfile = Self::tarfile(inbound)?;
        let store = self.open_store(inbound).await?;

        // wanted members, keyed by their deterministic object key
        let mut wanted: std::collections::HashMap<String, PathDetails> = message
            .data
            .filelist
            .iter()
            .map(|pd| (object_key(&pd.original_path), pd.clone()))
            .collect();

        let stream = match self.tape.get_stream(&tarfile).await {
            Ok(stream) => stream,
            Err(e) => return self.retry_recall(inbound, e.to_string()).await,
        };
        let mut reader = TarStreamReader::new(stream);

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        loop {
            let member = match reader.next_member().await {
                Ok(Some(member)) => member,
                Ok(None) => break,
                // a broken stream fails the whole aggregate
                Err(e) => return self.retry_recall(inbound, e.to_string()).await,
            };
            let key_part = member
                .name
                .rsplit('/')
                .next()
                .unwrap_or(member.name.as_str())
                .to_string();
            let Some(mut pd) = wanted.remove(&key_part) else {
                if let Err(e) = reader.skip_member(member.size).await {
                    return self.retry_recall(inbound, e.to_string()).await;
                }
                continue;
            };
            let bucket = member
                .name
                .rsplit_once('/')
                .map(|(b, _)| b.to_string())
                .unwrap_or_default();

            match self
                .extract_member(&store, &mut reader, &bucket, &key_part, member.size)
                .await
            {
                Ok(()) => {
                    if let Some(loc) = pd.locations.get_mut(StorageType::ObjectStore) {
                        loc.path = key_part.clone();
                    }
                    pd.object_name = Some(format!("{bucket}/{key_part}"));
                    completed.push(pd);
                }
                Err(ExtractError::Member(reason)) => {
                    pd.record_retry(reason);
                    failed.push(pd);
                }
                Err(ExtractError::Stream(reason)) => {
                    // put the member back so the whole-aggregate retry sees it
                    wanted.insert(key_part, pd);
                    for (_, pd) in wanted.drain() {
                        failed.push(pd);
                    }
                    let mut retry_message = message.reply_with(
                        completed.iter().chain(failed.iter()).cloned().collect(),
                    );
                    retry_message.data.tarfile = Some(tarfile.clone());
                    return self.retry_recall_with(inbound, &retry_message, reason).await;
                }
            }
        }

        // members that never appeared in the tar
        for (_, mut pd) in wanted.drain() {
            pd.record_permanent_failure(
                format!("member missing from aggregate {tarfile}"),
                self.schedule.max_retries(),
            );
            failed.push(pd);
        }

        let checksum = match reader.finish().await {
            Ok(checksum) => checksum,
            Err(e) => return self.retry_recall(inbound, e.to_string()).await,
        };
        if self.config.query_checksum {
            if let Some(expected) = message.data.checksum {
                if checksum != expected {
                    return self
                        .retry_recall(
                            inbound,
                            format!(
                                "aggregate checksum mismatch: read {checksum:08x}, catalog {expected:08x}"
                            ),
                        )
                        .await;
                }
            }
        }

        if !completed.is_empty() {
            let mut complete = message.reply_with(completed);
            complete.data.tarfile = Some(tarfile.clone());
            let key = inbound.key.reply(rk::ARCHIVE_GET, rk::COMPLETE);
            inbound
                .publisher
                .publish(&key, &complete)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
            inbound
                .publisher
                .notify_monitor(inbound.key, &complete, State::ArchiveGetting)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        if !failed.is_empty() {
            inbound
                .publisher
                .send_pathlist(
                    inbound.key,
                    message,
                    failed,
                    rk::ARCHIVE_GET,
                    rk::FAILED,
                    State::Failed,
                )
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn extract_member(
        &self,
        store: &Arc<dyn ObjectStore>,
        reader: &mut TarStreamReader,
        bucket: &str,
        key: &str,
        size: u64,
    ) -> Result<(), ExtractError> {
        if let Err(e) = store.ensure_bucket(bucket).await {
            reader
                .skip_member(size)
                .await
                .map_err(|e| ExtractError::Stream(e.to_string()))?;
            return Err(ExtractError::Member(format!("bucket creation failed: {e}")));
        }
        let mut upload = match store.put_stream(bucket, key).await {
            Ok(upload) => upload,
            Err(e) => {
                reader
                    .skip_member(size)
                    .await
                    .map_err(|e| ExtractError::Stream(e.to_string()))?;
                return Err(ExtractError::Member(e.to_string()));
            }
        };

        let mut remaining = size;
        while remaining > 0 {
            let chunk = reader
                .read_data(remaining, self.config.chunk_size)
                .await
                .map_err(|e| ExtractError::Stream(e.to_string()))?;
            if chunk.is_empty() {
                return Err(ExtractError::Stream("truncated tar member".to_string()));
            }
            remaining -= chunk.len() as u64;
            if let Err(e) = upload.write(chunk).await {
                let _ = upload.abort().await;
                // drain the member so the reader stays aligned
                while remaining > 0 {
                    let chunk = reader
                        .read_data(remaining, self.config.chunk_size)
                        .await
                        .map_err(|e| ExtractError::Stream(e.to_string()))?;
                    if chunk.is_empty() {
                        return Err(ExtractError::Stream("truncated tar member".to_string()));
                    }
                    remaining -= chunk.len() as u64;
                }
                reader
                    .skip_padding(size)
                    .await
                    .map_err(|e| ExtractError::Stream(e.to_string()))?;
                return Err(ExtractError::Member(e.to_string()));
            }
        }
        reader
            .skip_padding(size)
            .await
            .map_err(|e| ExtractError::Stream(e.to_string()))?;
        upload
            .finish()
            .await
            .map_err(|e| ExtractError::Member(e.to_string()))?;
        Ok(())
    }

    /// Whole-aggregate failure: retry through prepare (the staging may have
    /// been evicted) or fail every member once attempts are exhausted.
    async fn retry_recall(&self, inbound: &Inbound<'_>, reason: String) -> Result<(), ProcessError> {
        let message = inbound.message.clone();
        self.retry_recall_with(inbound, &message, reason).await
    }

    async fn retry_recall_with(
        &self,
        inbound: &Inbound<'_>,
        message: &nearline_core::Message,
        reason: String,
    ) -> Result<(), ProcessError> {
        let mut filelist = message.data.filelist.clone();
        for pd in &mut filelist {
            pd.record_retry(reason.clone());
            // the counter never passes the cap, even on aggregate-wide retries
            pd.retries = pd.retries.min(self.schedule.max_retries());
        }
        let exhausted = filelist
            .iter()
            .all(|pd| self.schedule.exhausted(pd.retries));
        let mut onward = message.reply_with(filelist);
        onward.data.tarfile = message.data.tarfile.clone();
        onward.data.checksum = message.data.checksum;
        onward.data.aggregation_id = message.data.aggregation_id;

        if exhausted {
            let key = inbound.key.reply(rk::ARCHIVE_GET, rk::FAILED);
            inbound
                .publisher
                .publish(&key, &onward)
                .map_err(|e| ProcessError::Transient(e.to_string()))?;
            return inbound
                .publisher
                .notify_monitor(inbound.key, &onward, State::Failed)
                .map_err(|e| ProcessError::Transient(e.to_string()));
        }
        let delay = onward
            .data
            .filelist
            .iter()
            .map(|pd| self.schedule.delay_for(pd.retries))
            .max()
            .unwrap_or_default();
        tracing::warn!(
            reason,
            delay_ms = delay.as_millis() as u64,
            "recall failed, retrying through prepare"
        );
        let key = inbound.key.reply(rk::ARCHIVE_GET, rk::PREPARE);
        inbound
            .publisher
            .publish_delayed(&key, &onward, delay)
            .map_err(|e| ProcessError::Transient(e.to_string()))?;
        inbound
            .publisher
            .notify_monitor(inbound.key, &onward, State::ArchiveGetting)
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }

    async fn fail_all(&self, inbound: &Inbound<'_>, reason: String) -> Result<(), ProcessError> {
        let mut filelist = inbound.message.data.filelist.clone();
        for pd in &mut filelist {
            pd.record_permanent_failure(reason.clone(), self.schedule.max_retries());
        }
        inbound
            .publisher
            .send_pathlist(
                inbound.key,
                inbound.message,
                filelist,
                rk::ARCHIVE_GET,
                rk::FAILED,
                State::Failed,
            )
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }
}

enum ExtractError {
    /// One member failed; the stream is still aligned.
    Member(String),
    /// The stream itself broke; the whole aggregate must retry.
    Stream(String),
}

#[async_trait]
impl Processor for ArchiveGetProcessor {
    fn name(&self) -> &'static str {
        "archive-get"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        match inbound.key.state.as_str() {
            rk::PREPARE => self.prepare(&inbound).await,
            rk::PREPARE_CHECK => self.prepare_check(&inbound).await,
            rk::START => self.extract(&inbound).await,
            other => Err(ProcessError::Protocol(format!(
                "unknown archive-get state: {other}"
            ))),
        }
    }
}
