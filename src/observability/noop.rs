use super::traits::{Observer, ObserverEvent, ObserverMetric};

/// Zero-overhead observer; all methods compile to nothing
pub struct NoopObserver;

impl Observer for NoopObserver {
    #[inline(always)]
    fn record_event(&self, _event: &ObserverEvent) {}

    #[inline(always)]
    fn record_metric(&self, _metric: &ObserverMetric) {}

    fn name(&self) -> &str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn noop_name() {
        assert_eq!(NoopObserver.name(), "noop");
    }

    #[test]
    fn noop_records_do_not_panic() {
        let obs = NoopObserver;
        obs.record_event(&ObserverEvent::OperatorCommand {
            command: "pause".into(),
            changed: false,
        });
        obs.record_metric(&ObserverMetric::EvaluationLatency(Duration::from_millis(5)));
        obs.flush();
    }
}
