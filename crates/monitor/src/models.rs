//! Row types for the monitor database.

use nearline_core::State;
use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;

/// One user CRUD action, as seen by the monitor.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct TransactionRecordRow {
    pub id: i64,
    pub transaction_id: String,
    pub user_name: String,
    pub group_name: String,
    pub api_action: String,
    pub job_label: Option<String>,
    pub creation_time: OffsetDateTime,
}

/// One sub-transaction's furthest state.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct SubRecordRow {
    pub id: i64,
    pub sub_id: String,
    pub state: String,
    pub retry_count: i64,
    pub last_updated: OffsetDateTime,
    pub transaction_record_id: i64,
}

impl SubRecordRow {
    pub fn parsed_state(&self) -> nearline_core::Result<State> {
        State::parse(&self.state)
    }
}

/// A permanently failed file with its final reason.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct FailedFileRow {
    pub id: i64,
    pub filepath: String,
    pub reason: String,
    pub sub_record_id: i64,
}

/// A non-fatal note attached to a transaction.
#[derive(Clone, Debug, FromRow, Serialize)]
pub struct WarningRow {
    pub id: i64,
    pub warning: String,
    pub transaction_record_id: i64,
}

/// The user-visible state of a whole transaction: the least advanced sub
/// state, except that once every sub is terminal any failure wins.
pub fn rollup_state(sub_states: &[State]) -> Option<State> {
    if sub_states.is_empty() {
        return None;
    }
    let all_terminal = sub_states.iter().all(|s| s.is_terminal());
    if all_terminal {
        if sub_states.contains(&State::Failed) {
            return Some(State::Failed);
        }
        return Some(State::Complete);
    }
    sub_states
        .iter()
        .filter(|s| !s.is_terminal())
        .copied()
        .min_by_key(|s| s.rank())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollup_is_least_advanced_while_running() {
        let states = [State::TransferPutting, State::Indexing, State::Complete];
        assert_eq!(rollup_state(&states), Some(State::Indexing));
    }

    #[test]
    fn rollup_failed_once_all_terminal() {
        assert_eq!(
            rollup_state(&[State::Complete, State::Failed]),
            Some(State::Failed)
        );
        assert_eq!(
            rollup_state(&[State::Complete, State::Complete]),
            Some(State::Complete)
        );
    }

    #[test]
    fn rollup_running_sub_hides_failure() {
        // not yet terminal overall: still reports progress, not failure
        assert_eq!(
            rollup_state(&[State::Failed, State::Indexing]),
            Some(State::Indexing)
        );
    }

    #[test]
    fn rollup_of_nothing_is_none() {
        assert_eq!(rollup_state(&[]), None);
    }
}
