//! Sub-transaction states and the ratchet order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of a single sub-transaction as tracked by the monitor.
///
/// States are ratcheted: an update only applies when the incoming state's
/// rank is strictly greater than the stored one, which makes monitor updates
/// idempotent under at-least-once delivery and reordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Routing,
    Splitting,
    Indexing,
    CatalogPutting,
    TransferPutting,
    Cataloging,
    CatalogGetting,
    ArchiveGetting,
    TransferGetting,
    ArchivePutting,
    CatalogArchiveAggregating,
    Complete,
    Failed,
}

impl State {
    /// The ratchet rank. Gaps leave room between the put, get and archive
    /// workflows, mirroring the monitor's partial order.
    pub fn rank(self) -> u32 {
        match self {
            State::Routing => 0,
            State::Splitting => 1,
            State::Indexing => 2,
            State::CatalogPutting => 3,
            State::TransferPutting => 4,
            State::Cataloging => 5,
            State::CatalogGetting => 10,
            State::ArchiveGetting => 11,
            State::TransferGetting => 12,
            State::ArchivePutting => 20,
            State::CatalogArchiveAggregating => 21,
            State::Complete => 100,
            State::Failed => 101,
        }
    }

    /// Terminal states end a sub-transaction; a transaction is finished when
    /// every sub-record is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Complete | State::Failed)
    }

    /// Whether an update from `self` to `next` passes the ratchet.
    pub fn ratchet_allows(self, next: State) -> bool {
        next.rank() > self.rank()
    }

    /// Stable textual name, used for the database columns.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Routing => "routing",
            State::Splitting => "splitting",
            State::Indexing => "indexing",
            State::CatalogPutting => "catalog_putting",
            State::TransferPutting => "transfer_putting",
            State::Cataloging => "cataloging",
            State::CatalogGetting => "catalog_getting",
            State::ArchiveGetting => "archive_getting",
            State::TransferGetting => "transfer_getting",
            State::ArchivePutting => "archive_putting",
            State::CatalogArchiveAggregating => "catalog_archive_aggregating",
            State::Complete => "complete",
            State::Failed => "failed",
        }
    }

    pub fn parse(name: &str) -> crate::Result<State> {
        Ok(match name {
            "routing" => State::Routing,
            "splitting" => State::Splitting,
            "indexing" => State::Indexing,
            "catalog_putting" => State::CatalogPutting,
            "transfer_putting" => State::TransferPutting,
            "cataloging" => State::Cataloging,
            "catalog_getting" => State::CatalogGetting,
            "archive_getting" => State::ArchiveGetting,
            "transfer_getting" => State::TransferGetting,
            "archive_putting" => State::ArchivePutting,
            "catalog_archive_aggregating" => State::CatalogArchiveAggregating,
            "complete" => State::Complete,
            "failed" => State::Failed,
            other => return Err(crate::Error::UnknownState(other.to_string())),
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratchet_moves_forward_only() {
        assert!(State::Routing.ratchet_allows(State::Indexing));
        assert!(State::Indexing.ratchet_allows(State::TransferPutting));
        assert!(!State::TransferPutting.ratchet_allows(State::Indexing));
        assert!(!State::Complete.ratchet_allows(State::Complete));
        // failed outranks complete so a late failure is still recorded
        assert!(State::Complete.ratchet_allows(State::Failed));
    }

    #[test]
    fn terminal_states() {
        assert!(State::Complete.is_terminal());
        assert!(State::Failed.is_terminal());
        assert!(!State::TransferGetting.is_terminal());
    }

    #[test]
    fn name_round_trip() {
        for state in [
            State::Routing,
            State::Splitting,
            State::Indexing,
            State::CatalogPutting,
            State::TransferPutting,
            State::Cataloging,
            State::CatalogGetting,
            State::ArchiveGetting,
            State::TransferGetting,
            State::ArchivePutting,
            State::CatalogArchiveAggregating,
            State::Complete,
            State::Failed,
        ] {
            assert_eq!(State::parse(state.as_str()).unwrap(), state);
        }
        assert!(State::parse("bogus").is_err());
    }
}
