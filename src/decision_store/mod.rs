//! At-most-once decision guard keyed by prompt identity.

mod sqlite;

pub use sqlite::SqliteDecisionStore;

use serde::Serialize;

/// Whether this caller produced the decision or found it already recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionOrigin {
    Computed,
    Recorded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome<T> {
    pub decision: T,
    pub origin: DecisionOrigin,
}

impl<T> DecisionOutcome<T> {
    /// Only the caller whose computation was recorded acts on the decision.
    pub fn is_fresh(&self) -> bool {
        self.origin == DecisionOrigin::Computed
    }
}
