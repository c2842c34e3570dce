pub mod log;
pub mod noop;
pub mod traits;

pub use self::log::LogObserver;
pub use noop::NoopObserver;
pub use traits::{Observer, ObserverEvent, ObserverMetric};

use crate::config::ObservabilityConfig;
use std::sync::Arc;

/// Build the observer named by `observability.backend`.
pub fn create_observer(config: &ObservabilityConfig) -> Arc<dyn Observer> {
    match config.backend.as_str() {
        "none" | "noop" => Arc::new(NoopObserver),
        "log" => Arc::new(LogObserver::new()),
        other => {
            tracing::warn!(backend = %other, "unknown observability backend; using log");
            Arc::new(LogObserver::new())
        }
    }
}
