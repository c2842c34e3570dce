//! Classify → plan → execute.

mod classify;
mod execute;
mod plan;
mod reply;

pub use classify::{Classification, InteractionClass, classify};
pub use execute::{ExecutionReport, Executor, InjectionGate};
pub use plan::{
    ExecutionPlan, PlannedAction, ReplySource, RetryPolicy, plan_for_policy, plan_for_reply,
};
pub use reply::{ReplyValue, affirmative_text, negative_text};
