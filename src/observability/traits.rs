use std::time::Duration;

/// Events the observer can record
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    PromptDetected {
        session_id: String,
        prompt_type: String,
        tier: String,
        refined: bool,
    },
    DecisionMade {
        rule_id: String,
        action: String,
        route: String,
    },
    LifecycleTransition {
        from: String,
        to: String,
    },
    InjectionAttempt {
        attempt: u32,
        outcome: String,
    },
    Anomaly {
        rule_id: String,
        detail: String,
    },
    OperatorCommand {
        command: String,
        changed: bool,
    },
    IntegrityFailure {
        log: String,
        first_invalid_step: Option<u64>,
    },
}

/// Numeric metrics
#[derive(Debug, Clone)]
pub enum ObserverMetric {
    QueueDepth(u64),
    ActiveSessions(u64),
    EvaluationLatency(Duration),
    InjectionAttempts(u64),
}

/// Core observability trait. Implement for any backend
pub trait Observer: Send + Sync {
    /// Record a discrete event
    fn record_event(&self, event: &ObserverEvent);

    /// Record a numeric metric
    fn record_metric(&self, metric: &ObserverMetric);

    /// Flush any buffered data (no-op for most backends)
    fn flush(&self) {}

    /// Human-readable name of this observer
    fn name(&self) -> &str;
}
