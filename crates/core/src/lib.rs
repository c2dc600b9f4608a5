//! Core domain types and shared logic for the near-line data store.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Per-file path details carried through every processing stage
//! - The inter-stage message envelope and routing-key grammar
//! - The sub-transaction state machine and its ratchet order
//! - The retry/back-off schedule
//! - Configuration for every stage

pub mod config;
pub mod details;
pub mod error;
pub mod message;
pub mod permissions;
pub mod retries;
pub mod routing;
pub mod state;

pub use details::{PathDetails, PathLocation, PathLocations, PathType, StorageType};
pub use error::{Error, Result};
pub use message::{ApiAction, Data, Details, Message};
pub use retries::RetrySchedule;
pub use routing::RoutingKey;
pub use state::State;

/// Default maximum number of paths per sub-transaction.
pub const DEFAULT_FILELIST_MAX_LENGTH: usize = 1000;

/// Default cumulative byte threshold at which the indexer emits a batch (500 GB).
pub const DEFAULT_MESSAGE_THRESHOLD: u64 = 500 * 1000 * 1000 * 1000;

/// Default per-file size ceiling, set by the tape cache size (500 GB).
pub const DEFAULT_MAX_FILESIZE: u64 = 500 * 1000 * 1000 * 1000;
