mod ledger;
mod lifecycle;
mod store;
mod types;

pub use ledger::LifecycleLedger;
pub use lifecycle::{
    LifecycleActor, LifecycleState, PromptLifecycle, Transition, check_transition,
};
pub use store::{HistoryItem, PromptRecord, SqliteLifecycleStore};
pub use types::{
    Choice, Confidence, ConfidenceTier, DetectionSignal, PromptEvent, PromptType, Refinement,
    excerpt_fingerprint,
};
