//! The monitor worker: state updates through the ratchet, and the RPC stat
//! surface.

use crate::models::rollup_state;
use crate::store::MonitorStore;
use async_trait::async_trait;
use nearline_core::routing as rk;
use nearline_core::{ApiAction, State};
use nearline_fabric::{Inbound, ProcessError, Processor};
use std::sync::Arc;

/// Handler for the monitor queue.
pub struct MonitorProcessor {
    store: Arc<dyn MonitorStore>,
}

impl MonitorProcessor {
    pub fn new(store: Arc<dyn MonitorStore>) -> Self {
        Self { store }
    }

    fn map_db_error(e: crate::error::MonitorError) -> ProcessError {
        if e.is_transient() {
            ProcessError::Transient(e.to_string())
        } else {
            ProcessError::Protocol(e.to_string())
        }
    }

    /// Apply one state update. Redeliveries and reorderings are absorbed by
    /// the ratchet, so this handler is idempotent.
    async fn monitor_put(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;
        let state = details
            .state
            .ok_or_else(|| ProcessError::Protocol("monitor update carries no state".to_string()))?;

        let transaction_id = details.transaction_id.to_string();
        let trec = match self
            .store
            .get_transaction_record(&transaction_id)
            .await
            .map_err(Self::map_db_error)?
        {
            Some(trec) => trec,
            None => self
                .store
                .create_transaction_record(
                    &transaction_id,
                    &details.user,
                    &details.group,
                    details.api_action.as_str(),
                    details.job_label.as_deref(),
                )
                .await
                .map_err(Self::map_db_error)?,
        };

        let sub_id = details.sub_id.to_string();
        let srec = match self
            .store
            .get_sub_record(&sub_id)
            .await
            .map_err(Self::map_db_error)?
        {
            Some(srec) => {
                let advanced = self
                    .store
                    .ratchet_sub_record(&sub_id, state)
                    .await
                    .map_err(Self::map_db_error)?;
                if !advanced {
                    tracing::debug!(sub_id, state = %state, "stale monitor update ignored");
                }
                srec
            }
            None => self
                .store
                .create_sub_record(trec.id, &sub_id, state)
                .await
                .map_err(Self::map_db_error)?,
        };

        // track the furthest per-file retry count for the stat surface
        let max_retries = message
            .data
            .filelist
            .iter()
            .map(|pd| i64::from(pd.retries))
            .max()
            .unwrap_or(0);
        if max_retries > srec.retry_count {
            self.store
                .set_retry_count(&sub_id, max_retries)
                .await
                .map_err(Self::map_db_error)?;
        }

        if state == State::Failed {
            let existing = self
                .store
                .get_failed_files(srec.id)
                .await
                .map_err(Self::map_db_error)?;
            for pd in &message.data.filelist {
                if existing.iter().any(|f| f.filepath == pd.original_path) {
                    continue;
                }
                let reason = pd.last_failure_reason().unwrap_or("unknown failure");
                self.store
                    .create_failed_file(srec.id, &pd.original_path, reason)
                    .await
                    .map_err(Self::map_db_error)?;
            }
        }

        Ok(())
    }

    /// Answer a stat query: one transaction's rollup, or every transaction
    /// for the caller.
    async fn monitor_get(&self, inbound: &Inbound<'_>) -> Result<(), ProcessError> {
        let message = inbound.message;
        let details = &message.details;

        let records = match details.api_action {
            ApiAction::Stat => match self
                .store
                .get_transaction_record(&details.transaction_id.to_string())
                .await
                .map_err(Self::map_db_error)?
            {
                Some(trec) => vec![trec],
                None => Vec::new(),
            },
            _ => self
                .store
                .list_transaction_records(&details.user, &details.group)
                .await
                .map_err(Self::map_db_error)?,
        };

        let mut out = Vec::new();
        for trec in &records {
            let subs = self
                .store
                .sub_records_of(trec.id)
                .await
                .map_err(Self::map_db_error)?;
            let states = subs
                .iter()
                .map(|s| s.parsed_state())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ProcessError::Protocol(e.to_string()))?;
            let rollup = rollup_state(&states);

            let mut sub_out = Vec::new();
            for sub in &subs {
                let failed = self
                    .store
                    .get_failed_files(sub.id)
                    .await
                    .map_err(Self::map_db_error)?;
                sub_out.push(serde_json::json!({
                    "sub_id": sub.sub_id,
                    "state": sub.state,
                    "retry_count": sub.retry_count,
                    "failed_files": failed.iter().map(|f| {
                        serde_json::json!({"filepath": f.filepath, "reason": f.reason})
                    }).collect::<Vec<_>>(),
                }));
            }
            let warnings = self
                .store
                .get_warnings(trec.id)
                .await
                .map_err(Self::map_db_error)?;
            out.push(serde_json::json!({
                "transaction_id": trec.transaction_id,
                "user": trec.user_name,
                "group": trec.group_name,
                "api_action": trec.api_action,
                "job_label": trec.job_label,
                "state": rollup.map(|s| s.as_str()),
                "sub_records": sub_out,
                "warnings": warnings.iter().map(|w| w.warning.clone()).collect::<Vec<_>>(),
            }));
        }

        let mut reply = message.reply_with(Vec::new());
        reply.meta = serde_json::json!({ "records": out });
        inbound
            .publisher
            .rpc_reply(inbound.delivery.properties(), &reply)
            .map_err(|e| ProcessError::Transient(e.to_string()))
    }
}

#[async_trait]
impl Processor for MonitorProcessor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    async fn process(&self, inbound: Inbound<'_>) -> Result<(), ProcessError> {
        match inbound.key.worker.as_str() {
            rk::MONITOR_PUT => self.monitor_put(&inbound).await,
            rk::MONITOR_GET => {
                if inbound.delivery.properties().reply_to.is_none() {
                    return Err(ProcessError::Protocol(
                        "monitor-get requires a reply queue".to_string(),
                    ));
                }
                self.monitor_get(&inbound).await
            }
            other => Err(ProcessError::Protocol(format!(
                "unknown monitor operation: {other}"
            ))),
        }
    }
}
