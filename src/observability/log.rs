use super::traits::{Observer, ObserverEvent, ObserverMetric};
use tracing::{info, warn};

/// Log-based observer: everything goes through tracing.
#[derive(Debug, Default)]
pub struct LogObserver;

impl LogObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::PromptDetected {
                session_id,
                prompt_type,
                tier,
                refined,
            } => {
                info!(session_id = %session_id, prompt_type = %prompt_type, tier = %tier, refined, "prompt.detected");
            }
            ObserverEvent::DecisionMade {
                rule_id,
                action,
                route,
            } => {
                info!(rule_id = %rule_id, action = %action, route = %route, "decision.made");
            }
            ObserverEvent::LifecycleTransition { from, to } => {
                info!(from = %from, to = %to, "lifecycle.transition");
            }
            ObserverEvent::InjectionAttempt { attempt, outcome } => {
                info!(attempt, outcome = %outcome, "injection.attempt");
            }
            ObserverEvent::Anomaly { rule_id, detail } => {
                warn!(rule_id = %rule_id, detail = %detail, "policy.anomaly");
            }
            ObserverEvent::OperatorCommand { command, changed } => {
                info!(command = %command, changed, "operator.command");
            }
            ObserverEvent::IntegrityFailure {
                log,
                first_invalid_step,
            } => {
                warn!(log = %log, first_invalid_step = ?first_invalid_step, "integrity.failure");
            }
        }
    }

    fn record_metric(&self, metric: &ObserverMetric) {
        match metric {
            ObserverMetric::QueueDepth(d) => {
                info!(depth = d, "metric.queue_depth");
            }
            ObserverMetric::ActiveSessions(s) => {
                info!(sessions = s, "metric.active_sessions");
            }
            ObserverMetric::EvaluationLatency(d) => {
                let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
                info!(latency_us = us, "metric.evaluation_latency");
            }
            ObserverMetric::InjectionAttempts(n) => {
                info!(attempts = n, "metric.injection_attempts");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}
