use super::Config;
use crate::autopilot::AutonomyMode;

impl Config {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("PROMPTWARDEN_MODE") {
            match mode.parse::<AutonomyMode>() {
                Ok(mode) => self.autopilot.mode = mode,
                Err(_) => tracing::warn!(value = %mode, "ignoring invalid PROMPTWARDEN_MODE"),
            }
        }

        if let Ok(rules) = std::env::var("PROMPTWARDEN_RULES")
            && !rules.is_empty()
        {
            self.policy.rules_path = rules;
        }

        if let Ok(state_dir) = std::env::var("PROMPTWARDEN_STATE_DIR")
            && !state_dir.is_empty()
        {
            self.storage.state_dir = state_dir;
        }

        if let Ok(level) = std::env::var("PROMPTWARDEN_LOG")
            && !level.is_empty()
        {
            self.observability.log_level = level;
        }
    }
}
