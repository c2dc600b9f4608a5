//! The inter-stage message envelope.
//!
//! Every message carries `details` (correlation and credentials), `meta`
//! (opaque caller metadata) and `data` (the filelist and per-stage payload).
//! `details` and `meta` are preserved verbatim across stages; only `data` is
//! rewritten by the stage that handles the message.

use crate::details::PathDetails;
use crate::error::Result;
use crate::state::State;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The user-level operation a transaction performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApiAction {
    Put,
    Get,
    Del,
    Putlist,
    Getlist,
    Dellist,
    ArchivePut,
    List,
    Find,
    Stat,
    Quota,
    SystemStat,
}

impl ApiAction {
    /// Stable textual name, used for the monitor's api_action column.
    pub fn as_str(self) -> &'static str {
        match self {
            ApiAction::Put => "put",
            ApiAction::Get => "get",
            ApiAction::Del => "del",
            ApiAction::Putlist => "putlist",
            ApiAction::Getlist => "getlist",
            ApiAction::Dellist => "dellist",
            ApiAction::ArchivePut => "archive-put",
            ApiAction::List => "list",
            ApiAction::Find => "find",
            ApiAction::Stat => "stat",
            ApiAction::Quota => "quota",
            ApiAction::SystemStat => "system-stat",
        }
    }

    /// Whether this action flows through the put workflow.
    pub fn is_put(self) -> bool {
        matches!(self, ApiAction::Put | ApiAction::Putlist)
    }

    pub fn is_get(self) -> bool {
        matches!(self, ApiAction::Get | ApiAction::Getlist)
    }

    pub fn is_del(self) -> bool {
        matches!(self, ApiAction::Del | ApiAction::Dellist)
    }
}

/// Correlation and credential data, preserved verbatim across stages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Details {
    pub transaction_id: Uuid,
    pub sub_id: Uuid,
    pub user: String,
    pub group: String,
    pub api_action: ApiAction,
    /// Target directory for gets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenancy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holding_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holding_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    /// The sub-transaction state this message reports to the monitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
}

impl Details {
    pub fn new(user: impl Into<String>, group: impl Into<String>, api_action: ApiAction) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            sub_id: Uuid::new_v4(),
            user: user.into(),
            group: group.into(),
            api_action,
            target: None,
            tenancy: None,
            access_key: None,
            secret_key: None,
            job_label: None,
            holding_label: None,
            holding_id: None,
            tags: None,
            state: None,
        }
    }
}

/// The mutable payload section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Data {
    #[serde(default)]
    pub filelist: Vec<PathDetails>,
    /// Tape-issued prepare id, carried between prepare and prepare-check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare_id: Option<String>,
    /// Aggregate tar name, set by archive-put.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tarfile: Option<String>,
    /// Rolling checksum over the aggregate, set by archive-put.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_algorithm: Option<String>,
    /// Catalog aggregation the filelist belongs to, on the archive paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_id: Option<i64>,
}

/// The full envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub details: Details,
    /// Opaque caller metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub data: Data,
}

impl Message {
    pub fn new(details: Details) -> Self {
        Self {
            details,
            meta: serde_json::Value::Null,
            data: Data::default(),
        }
    }

    pub fn with_filelist(details: Details, filelist: Vec<PathDetails>) -> Self {
        Self {
            details,
            meta: serde_json::Value::Null,
            data: Data {
                filelist,
                ..Data::default()
            },
        }
    }

    /// A copy of this message carrying a different filelist. `details` and
    /// `meta` are preserved verbatim.
    pub fn reply_with(&self, filelist: Vec<PathDetails>) -> Message {
        Message {
            details: self.details.clone(),
            meta: self.meta.clone(),
            data: Data {
                filelist,
                ..Data::default()
            },
        }
    }

    /// A copy for a fresh sub-transaction, as produced by the indexer split.
    /// The child's sub_id is derived from the parent's and the chunk index,
    /// so a replayed split reproduces the same children instead of spawning
    /// duplicates.
    pub fn split_child(&self, index: u64, filelist: Vec<PathDetails>) -> Message {
        let mut child = self.reply_with(filelist);
        child.details.sub_id = Uuid::new_v5(&self.details.sub_id, &index.to_le_bytes());
        child
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut details = Details::new("alice", "climate", ApiAction::Putlist);
        details.job_label = Some("exp1".to_string());
        let mut msg = Message::with_filelist(
            details,
            vec![
                PathDetails::from_path("/data/a.txt"),
                PathDetails::from_path("/data/b.txt"),
            ],
        );
        msg.meta = serde_json::json!({"client": "cli", "version": 3});
        msg
    }

    #[test]
    fn envelope_round_trips() {
        let msg = sample();
        let bytes = msg.to_bytes().unwrap();
        let back = Message::from_bytes(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn reply_preserves_details_and_meta() {
        let msg = sample();
        let reply = msg.reply_with(vec![PathDetails::from_path("/data/a.txt")]);
        assert_eq!(reply.details, msg.details);
        assert_eq!(reply.meta, msg.meta);
        assert_eq!(reply.data.filelist.len(), 1);
    }

    #[test]
    fn split_children_are_fresh_but_deterministic() {
        let msg = sample();
        let child = msg.split_child(0, vec![]);
        assert_eq!(child.details.transaction_id, msg.details.transaction_id);
        assert_ne!(child.details.sub_id, msg.details.sub_id);
        // replaying the split reproduces the same sub ids
        assert_eq!(child.details.sub_id, msg.split_child(0, vec![]).details.sub_id);
        assert_ne!(child.details.sub_id, msg.split_child(1, vec![]).details.sub_id);
    }

    #[test]
    fn unknown_data_fields_do_not_break_decoding() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["data"]["future_field"] = serde_json::json!("ignored");
        let text = serde_json::to_string(&value).unwrap();
        assert!(Message::from_bytes(text.as_bytes()).is_ok());
    }
}
