mod env_overrides;
mod loader;
mod sections;
#[cfg(test)]
mod test_env;

pub use sections::{
    AutopilotConfig, DetectorConfig, LifecycleConfig, ObservabilityConfig, PipelineConfig,
    PolicyConfig, StorageConfig,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub autopilot: AutopilotConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detector;
        for (name, value) in [
            ("detector.silence_threshold_ms", d.silence_threshold_ms),
            ("detector.blocked_read_min_idle_ms", d.blocked_read_min_idle_ms),
            ("detector.tie_break_window_ms", d.tie_break_window_ms),
            ("detector.probe_interval_ms", d.probe_interval_ms),
            ("lifecycle.reply_timeout_secs", self.lifecycle.reply_timeout_secs),
            ("lifecycle.sweep_interval_secs", self.lifecycle.sweep_interval_secs),
            ("policy.match_timeout_ms", self.policy.match_timeout_ms),
            ("pipeline.verify_timeout_ms", self.pipeline.verify_timeout_ms),
            ("pipeline.verify_poll_ms", self.pipeline.verify_poll_ms),
            ("storage.claim_wait_ms", self.storage.claim_wait_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be > 0")));
            }
        }

        if d.silence_threshold_ms <= d.blocked_read_min_idle_ms {
            return Err(ConfigError::Validation(
                "detector.silence_threshold_ms must exceed detector.blocked_read_min_idle_ms"
                    .into(),
            ));
        }
        if d.tail_lines == 0 || d.excerpt_max_chars == 0 {
            return Err(ConfigError::Validation(
                "detector.tail_lines and detector.excerpt_max_chars must be > 0".into(),
            ));
        }

        let p = &self.pipeline;
        if p.max_injection_attempts == 0 {
            return Err(ConfigError::Validation(
                "pipeline.max_injection_attempts must be >= 1".into(),
            ));
        }
        if p.initial_backoff_ms > p.max_backoff_ms {
            return Err(ConfigError::Validation(format!(
                "pipeline.initial_backoff_ms ({}) exceeds pipeline.max_backoff_ms ({})",
                p.initial_backoff_ms, p.max_backoff_ms
            )));
        }
        if p.verify_poll_ms > p.verify_timeout_ms {
            return Err(ConfigError::Validation(
                "pipeline.verify_poll_ms must not exceed pipeline.verify_timeout_ms".into(),
            ));
        }

        if self.policy.max_pattern_size == 0 {
            return Err(ConfigError::Validation(
                "policy.max_pattern_size must be > 0".into(),
            ));
        }

        match self.observability.backend.as_str() {
            "log" | "none" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "observability.backend must be \"log\" or \"none\", got \"{other}\""
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.detector.silence_threshold_ms, 8_000);
        assert_eq!(config.pipeline.max_injection_attempts, 3);
        assert_eq!(config.storage.claim_wait_ms, 5_000);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [detector]
            silence_threshold_ms = 12000

            [autopilot]
            mode = "full"
            "#,
        )
        .unwrap();
        assert_eq!(config.detector.silence_threshold_ms, 12_000);
        assert_eq!(config.detector.blocked_read_min_idle_ms, 750);
        assert_eq!(config.autopilot.mode, crate::autopilot::AutonomyMode::Full);
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = Config::default();
        config.pipeline.max_injection_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_injection_attempts"));
    }

    #[test]
    fn backoff_inversion_rejected() {
        let mut config = Config::default();
        config.pipeline.initial_backoff_ms = 5_000;
        config.pipeline.max_backoff_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn silence_must_exceed_blocked_read_idle() {
        let mut config = Config::default();
        config.detector.silence_threshold_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        let mut config = Config::default();
        config.observability.backend = "prometheus".into();
        assert!(config.validate().is_err());
    }
}
