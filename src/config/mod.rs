pub mod schema;

pub use schema::{
    AutopilotConfig, Config, DetectorConfig, LifecycleConfig, ObservabilityConfig, PipelineConfig,
    PolicyConfig, StorageConfig,
};
