use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use super::orchestrator::Autopilot;
use crate::config::Config;
use crate::decision_store::SqliteDecisionStore;
use crate::notify::NotificationChannel;
use crate::observability::Observer;
use crate::policy::{PolicyEvaluator, RuleSetHandle};
use crate::prompt::LifecycleLedger;
use crate::trust_log::TrustLogs;

/// Everything a session needs, shared by every session of one daemon.
#[derive(Clone)]
pub struct WardenServices {
    pub config: Arc<Config>,
    pub autopilot: Arc<Autopilot>,
    pub ledger: LifecycleLedger,
    pub decisions: Arc<SqliteDecisionStore>,
    pub rules: RuleSetHandle,
    pub evaluator: Arc<PolicyEvaluator>,
    pub notifier: Arc<dyn NotificationChannel>,
    pub observer: Arc<dyn Observer>,
    pub active_sessions: Arc<AtomicU64>,
}

impl WardenServices {
    pub fn logs(&self) -> &TrustLogs {
        self.ledger.logs()
    }
}
