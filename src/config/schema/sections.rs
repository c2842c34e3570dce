use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::autopilot::AutonomyMode;

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

// ── Detector ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Idle time before the silence signal fires
    #[serde(default = "default_silence_threshold_ms")]
    pub silence_threshold_ms: u64,
    /// Minimum idle time before a blocked read counts as a prompt
    #[serde(default = "default_blocked_read_min_idle_ms")]
    pub blocked_read_min_idle_ms: u64,
    /// Window in which a stronger signal refines an earlier event
    #[serde(default = "default_tie_break_window_ms")]
    pub tie_break_window_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_excerpt_max_chars")]
    pub excerpt_max_chars: usize,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

fn default_silence_threshold_ms() -> u64 {
    8_000
}

fn default_blocked_read_min_idle_ms() -> u64 {
    750
}

fn default_tie_break_window_ms() -> u64 {
    3_000
}

fn default_probe_interval_ms() -> u64 {
    250
}

fn default_excerpt_max_chars() -> usize {
    400
}

fn default_tail_lines() -> usize {
    12
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: default_silence_threshold_ms(),
            blocked_read_min_idle_ms: default_blocked_read_min_idle_ms(),
            tie_break_window_ms: default_tie_break_window_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            excerpt_max_chars: default_excerpt_max_chars(),
            tail_lines: default_tail_lines(),
        }
    }
}

impl DetectorConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn blocked_read_min_idle(&self) -> Duration {
        Duration::from_millis(self.blocked_read_min_idle_ms)
    }

    pub fn tie_break_window(&self) -> Duration {
        Duration::from_millis(self.tie_break_window_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long a prompt may wait for a reply before it expires
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_reply_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    5
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: default_reply_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl LifecycleConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

// ── Policy ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_rules_path")]
    pub rules_path: String,
    /// Wall-clock budget for one rule's composite pattern match
    #[serde(default = "default_match_timeout_ms")]
    pub match_timeout_ms: u64,
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    /// Upper bound on a compiled rule pattern, in bytes
    #[serde(default = "default_max_pattern_size")]
    pub max_pattern_size: usize,
}

fn default_rules_path() -> String {
    "~/.promptwarden/rules.toml".into()
}

fn default_match_timeout_ms() -> u64 {
    250
}

fn default_reload_interval_secs() -> u64 {
    10
}

fn default_max_pattern_size() -> usize {
    1 << 20
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules_path: default_rules_path(),
            match_timeout_ms: default_match_timeout_ms(),
            reload_interval_secs: default_reload_interval_secs(),
            max_pattern_size: default_max_pattern_size(),
        }
    }
}

impl PolicyConfig {
    pub fn rules_path(&self) -> PathBuf {
        expand_path(&self.rules_path)
    }

    pub fn match_timeout(&self) -> Duration {
        Duration::from_millis(self.match_timeout_ms)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_injection_attempts")]
    pub max_injection_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// How long one injection attempt waits for the process to move on
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default = "default_verify_poll_ms")]
    pub verify_poll_ms: u64,
    /// Recent prompts per session consulted by the classifier
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_max_injection_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_verify_timeout_ms() -> u64 {
    1_500
}

fn default_verify_poll_ms() -> u64 {
    100
}

fn default_history_window() -> usize {
    8
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_injection_attempts: default_max_injection_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            verify_poll_ms: default_verify_poll_ms(),
            history_window: default_history_window(),
        }
    }
}

// ── Autopilot ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotConfig {
    #[serde(default)]
    pub mode: AutonomyMode,
    #[serde(default = "default_integrity_check_interval_secs")]
    pub integrity_check_interval_secs: u64,
}

fn default_integrity_check_interval_secs() -> u64 {
    60
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            mode: AutonomyMode::default(),
            integrity_check_interval_secs: default_integrity_check_interval_secs(),
        }
    }
}

impl AutopilotConfig {
    pub fn integrity_check_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_check_interval_secs)
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// How long a caller waits on another caller's pending decision
    #[serde(default = "default_claim_wait_ms")]
    pub claim_wait_ms: u64,
}

fn default_state_dir() -> String {
    "~/.promptwarden/state".into()
}

fn default_claim_wait_ms() -> u64 {
    5_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            claim_wait_ms: default_claim_wait_ms(),
        }
    }
}

impl StorageConfig {
    pub fn state_dir(&self) -> PathBuf {
        expand_path(&self.state_dir)
    }

    pub fn decisions_db(&self) -> PathBuf {
        self.state_dir().join("decisions.db")
    }

    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }
}

// ── Observability ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// "log" | "none"
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_backend() -> String {
    "log".into()
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            log_level: default_log_level(),
        }
    }
}
