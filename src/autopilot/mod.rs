//! Autonomy lifecycle, operator commands and the per-session runtime that
//! ties detection, policy and execution together.

mod orchestrator;
mod routing;
mod services;
mod session;
mod state;
mod sweep;

pub use orchestrator::Autopilot;
pub use routing::{Route, RoutingDecision, route};
pub use services::WardenServices;
pub use session::{SessionRuntime, SessionSummary};
pub use state::{
    AutonomyMode, AutopilotLifecycle, AutopilotSnapshot, AutopilotState, CommandOutcome,
    OperatorCommand,
};
pub use sweep::{RestartReport, expire_overdue, restart_sweep};
