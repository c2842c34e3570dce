use thiserror::Error;

use crate::prompt::LifecycleState;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `promptwarden`.
///
/// Each subsystem defines its own error variant. The orchestrator matches on
/// these to decide whether a failure is local to one prompt or must halt
/// autonomous execution; IO boundaries keep using `anyhow::Result` for
/// context chains.
#[derive(Debug, Error)]
pub enum WardenError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Trust log ───────────────────────────────────────────────────────
    #[error("trust log: {0}")]
    TrustLog(#[from] TrustLogError),

    // ── Decision store ──────────────────────────────────────────────────
    #[error("decision store: {0}")]
    DecisionStore(#[from] DecisionStoreError),

    // ── Prompt lifecycle ────────────────────────────────────────────────
    #[error("lifecycle: {0}")]
    Lifecycle(#[from] LifecycleError),

    // ── Policy ──────────────────────────────────────────────────────────
    #[error("policy: {0}")]
    Policy(#[from] RuleLoadError),

    // ── Interaction pipeline ────────────────────────────────────────────
    #[error("pipeline: {0}")]
    Pipeline(#[from] ExecutionError),

    // ── Autopilot ───────────────────────────────────────────────────────
    #[error("autopilot: {0}")]
    Autopilot(#[from] AutopilotError),

    // ── Collaborators ───────────────────────────────────────────────────
    #[error("process: {0}")]
    Process(String),

    #[error("notify: {0}")]
    Notify(String),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WardenError {
    /// Storage integrity failures halt autonomous execution (fail closed).
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::TrustLog(_) => true,
            Self::DecisionStore(err) => err.is_integrity_failure(),
            _ => false,
        }
    }
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Trust log errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TrustLogError {
    #[error("storage: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("payload encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("log {path} belongs to the {found} log, expected {expected}")]
    KindMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("incompatible schema version: stored={stored}, expected={expected}")]
    SchemaVersion { stored: String, expected: u32 },

    #[error("chain head is malformed at step {step}")]
    MalformedHead { step: i64 },
}

// ─── Decision store errors ──────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecisionStoreError {
    #[error("storage: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("record for prompt {prompt_id} is corrupt: {reason}")]
    Corrupt { prompt_id: String, reason: String },

    #[error("timed out waiting for the decision claimed on prompt {prompt_id}")]
    ClaimTimeout { prompt_id: String },

    #[error("decision computation failed for prompt {prompt_id}: {source}")]
    Compute {
        prompt_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DecisionStoreError {
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Storage(_))
    }
}

// ─── Lifecycle errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("prompt {prompt_id}: transition {from} -> {to} is not allowed")]
    IllegalTransition {
        prompt_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("prompt {prompt_id} is already terminal ({state}); refused -> {attempted}")]
    AlreadyTerminal {
        prompt_id: String,
        state: LifecycleState,
        attempted: LifecycleState,
    },

    #[error("prompt {prompt_id}: {actor} may not move {from} -> {to}")]
    ActorNotPermitted {
        prompt_id: String,
        actor: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("unknown prompt: {0}")]
    UnknownPrompt(String),

    #[error("prompt {prompt_id} changed concurrently; transition to {to} abandoned")]
    Contended {
        prompt_id: String,
        to: LifecycleState,
    },

    #[error("storage: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

// ─── Policy rule load errors ────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RuleLoadError {
    #[error("failed to read rules from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse rules: {0}")]
    Parse(String),

    #[error("duplicate rule id '{0}'")]
    DuplicateId(String),

    #[error("rule '{rule_id}' extends unknown rule '{parent}'")]
    UnknownParent { rule_id: String, parent: String },

    #[error("cyclic extends chain: {}", chain.join(" -> "))]
    CyclicExtends { chain: Vec<String> },

    #[error("rule '{rule_id}' has invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        reason: String,
    },

    #[error("rule '{0}' has no action after resolving extends")]
    MissingAction(String),

    #[error("rule '{rule_id}' has an invalid rate limit: {reason}")]
    InvalidRateLimit { rule_id: String, reason: String },

    #[error("rule '{rule_id}' has min_confidence above max_confidence")]
    InvertedConfidence { rule_id: String },

    #[error("rule id must not be empty or '{0}'")]
    ReservedId(String),
}

// ─── Execution errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("plan for prompt {0} carries no reply to inject")]
    NothingToInject(String),

    #[error("prompt {prompt_id} is {state}, expected reply_received")]
    NotReady {
        prompt_id: String,
        state: LifecycleState,
    },

    #[error("injection for prompt {prompt_id} aborted: autopilot is {autopilot}")]
    KillSwitch { prompt_id: String, autopilot: String },

    #[error("prompt {prompt_id} did not advance after {attempts} injection attempts")]
    VerificationExhausted { prompt_id: String, attempts: u32 },

    #[error("failed to write reply for prompt {prompt_id}: {source}")]
    Write {
        prompt_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    TrustLog(#[from] TrustLogError),
}

// ─── Autopilot errors ───────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AutopilotError {
    #[error("autopilot is stopped; {0} requires an explicit restart first")]
    Stopped(&'static str),

    #[error(transparent)]
    TrustLog(#[from] TrustLogError),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, WardenError>;
