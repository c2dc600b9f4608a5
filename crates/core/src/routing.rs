//! Routing-key grammar and the segment vocabulary.
//!
//! Every message is routed by a key of exactly three dot-separated segments,
//! `application.worker.state`, each matching `[A-Za-z0-9-]+`. Workers echo
//! the inbound `application` segment into every outbound key so replies route
//! back to the originating application's queues.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Application segment used by the API layer.
pub const ROOT: &str = "nearline-api";
/// Single-segment wildcard in queue bindings.
pub const WILD: &str = "*";
/// Multi-segment wildcard in queue bindings.
pub const HASH: &str = "#";

// Worker segments.
pub const ROUTE: &str = "route";
pub const INDEX: &str = "index";
pub const CATALOG_PUT: &str = "catalog-put";
pub const CATALOG_GET: &str = "catalog-get";
pub const CATALOG_DEL: &str = "catalog-del";
pub const CATALOG_UPDATE: &str = "catalog-update";
pub const CATALOG_REMOVE: &str = "catalog-remove";
pub const CATALOG_ARCHIVE_NEXT: &str = "catalog-archive-next";
pub const CATALOG_ARCHIVE_UPDATE: &str = "catalog-archive-update";
pub const CATALOG_ARCHIVE_DEL: &str = "catalog-archive-del";
pub const CATALOG_ARCHIVE_REMOVE: &str = "catalog-archive-remove";
pub const TRANSFER_PUT: &str = "transfer-put";
pub const TRANSFER_GET: &str = "transfer-get";
pub const ARCHIVE_PUT: &str = "archive-put";
pub const ARCHIVE_GET: &str = "archive-get";
pub const MONITOR_PUT: &str = "monitor-put";
pub const MONITOR_GET: &str = "monitor-get";
pub const LOG: &str = "log";

// State segments.
pub const INITIATE: &str = "init";
pub const START: &str = "start";
pub const COMPLETE: &str = "complete";
pub const FAILED: &str = "failed";
pub const REROUTE: &str = "reroute";
pub const ARCHIVE_RESTORE: &str = "archive-restore";
pub const PREPARE: &str = "prepare";
pub const PREPARE_CHECK: &str = "prepare-check";

// Command states used on `route.*` keys.
pub const PUT: &str = "put";
pub const GET: &str = "get";
pub const DEL: &str = "del";

// Log-level state segments for the logging queue.
pub const LOG_DEBUG: &str = "debug";
pub const LOG_INFO: &str = "info";
pub const LOG_WARNING: &str = "warning";
pub const LOG_ERROR: &str = "error";
pub const LOG_CRITICAL: &str = "critical";

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// A parsed `application.worker.state` routing key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey {
    pub application: String,
    pub worker: String,
    pub state: String,
}

impl RoutingKey {
    pub fn new(
        application: impl Into<String>,
        worker: impl Into<String>,
        state: impl Into<String>,
    ) -> Result<Self> {
        let key = Self {
            application: application.into(),
            worker: worker.into(),
            state: state.into(),
        };
        for segment in [&key.application, &key.worker, &key.state] {
            if !valid_segment(segment) {
                return Err(Error::InvalidRoutingKey(key.to_string()));
            }
        }
        Ok(key)
    }

    /// Build the next key in a workflow, preserving the inbound `application`
    /// segment. This back-reference is how replies find the originating
    /// application's queues.
    pub fn reply(&self, worker: &str, state: &str) -> RoutingKey {
        RoutingKey {
            application: self.application.clone(),
            worker: worker.to_string(),
            state: state.to_string(),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.application, self.worker, self.state)
    }
}

impl FromStr for RoutingKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');
        let (Some(application), Some(worker), Some(state), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidRoutingKey(s.to_string()));
        };
        RoutingKey::new(application, worker, state)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> String {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_segments() {
        let key: RoutingKey = "nearline-api.transfer-put.start".parse().unwrap();
        assert_eq!(key.application, "nearline-api");
        assert_eq!(key.worker, "transfer-put");
        assert_eq!(key.state, "start");
        assert_eq!(key.to_string(), "nearline-api.transfer-put.start");
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!("a.b".parse::<RoutingKey>().is_err());
        assert!("a.b.c.d".parse::<RoutingKey>().is_err());
        assert!("".parse::<RoutingKey>().is_err());
    }

    #[test]
    fn rejects_bad_characters() {
        assert!("app.wor ker.state".parse::<RoutingKey>().is_err());
        assert!("app..state".parse::<RoutingKey>().is_err());
        assert!("app.worker.st@te".parse::<RoutingKey>().is_err());
    }

    #[test]
    fn reply_preserves_application() {
        let key: RoutingKey = "my-app.index.complete".parse().unwrap();
        let next = key.reply(CATALOG_PUT, START);
        assert_eq!(next.to_string(), "my-app.catalog-put.start");
    }

    #[test]
    fn serde_round_trip() {
        let key: RoutingKey = "a.b.c".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"a.b.c\"");
        let back: RoutingKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
