use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TrustLogKind;

/// What gets serialized into an entry's `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: TrustPayload,
}

impl TrustRecord {
    pub fn now(payload: TrustPayload) -> Self {
        Self {
            recorded_at: Utc::now(),
            payload,
        }
    }
}

/// Closed catalogue of everything the runtime records.
///
/// `Decision` and `Operator` belong to the governance log; everything else
/// goes to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrustPayload {
    Decision {
        prompt_id: String,
        session_id: String,
        rule_id: String,
        action: String,
        explanation: String,
        confidence_tier: String,
        confidence_score: f64,
        mode: String,
        route: String,
    },
    Operator {
        command: String,
        before: String,
        after: String,
        changed: bool,
    },
    Lifecycle {
        prompt_id: String,
        from: String,
        to: String,
        actor: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Anomaly {
        prompt_id: String,
        rule_id: String,
        detail: String,
    },
    Injection {
        prompt_id: String,
        attempt: u32,
        outcome: String,
    },
    Alert {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_id: Option<String>,
        message: String,
    },
    Delivery {
        prompt_id: String,
        channel: String,
        error: String,
    },
    LateReply {
        prompt_id: String,
        state: String,
    },
    Integrity {
        log: String,
        valid: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_invalid_step: Option<u64>,
        message: String,
    },
    RulesReloaded {
        source: String,
        rule_count: usize,
        fingerprint: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Session {
        session_id: String,
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl TrustPayload {
    pub fn log_kind(&self) -> TrustLogKind {
        match self {
            Self::Decision { .. } | Self::Operator { .. } => TrustLogKind::Governance,
            _ => TrustLogKind::Audit,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Decision { .. } => "decision",
            Self::Operator { .. } => "operator",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Anomaly { .. } => "anomaly",
            Self::Injection { .. } => "injection",
            Self::Alert { .. } => "alert",
            Self::Delivery { .. } => "delivery",
            Self::LateReply { .. } => "late_reply",
            Self::Integrity { .. } => "integrity",
            Self::RulesReloaded { .. } => "rules_reloaded",
            Self::Session { .. } => "session",
        }
    }
}
