use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Shape of input the supervised process is asking for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PromptType {
    YesNo,
    ConfirmEnter,
    NumberedChoice,
    FreeText,
    MultiSelect,
}

/// Coarse trust tier of a detection. Ordered `Low < Medium < High`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConfidenceTier {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    pub tier: ConfidenceTier,
    pub score: f64,
}

impl Confidence {
    pub fn new(tier: ConfidenceTier, score: f64) -> Self {
        Self {
            tier,
            score: score.clamp(0.0, 1.0),
        }
    }

    /// The stronger of two confidences; tier first, score second.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        if other.outranks(self) { other } else { self }
    }

    pub fn outranks(self, other: Self) -> bool {
        self.tier > other.tier || (self.tier == other.tier && self.score > other.score)
    }
}

/// Which detection mechanism produced (or last refined) an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DetectionSignal {
    Pattern { matcher: String },
    BlockedRead { idle_ms: u64 },
    Silence { idle_ms: u64 },
}

impl DetectionSignal {
    pub fn tier(&self) -> ConfidenceTier {
        match self {
            Self::Pattern { .. } => ConfidenceTier::High,
            Self::BlockedRead { .. } => ConfidenceTier::Medium,
            Self::Silence { .. } => ConfidenceTier::Low,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pattern { .. } => "pattern",
            Self::BlockedRead { .. } => "blocked_read",
            Self::Silence { .. } => "silence",
        }
    }
}

/// One option of a numbered-choice prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub number: u32,
    pub label: String,
}

/// A detected request for input from a supervised process.
///
/// Identity never changes. The only permitted change is a confidence
/// refinement, which produces a new value through [`PromptEvent::refined`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEvent {
    pub id: Uuid,
    pub session_id: String,
    pub prompt_type: PromptType,
    pub excerpt: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub confidence: Confidence,
    pub signal: DetectionSignal,
    pub created_at: DateTime<Utc>,
}

/// Data carried by a later, stronger signal for the same prompt.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub confidence: Confidence,
    pub signal: DetectionSignal,
    pub prompt_type: PromptType,
    pub excerpt: String,
    pub choices: Vec<Choice>,
}

impl PromptEvent {
    /// Apply a refinement. A weaker refinement leaves the event unchanged.
    #[must_use]
    pub fn refined(&self, refinement: Refinement) -> Self {
        if !refinement.confidence.outranks(self.confidence) {
            return self.clone();
        }
        Self {
            id: self.id,
            session_id: self.session_id.clone(),
            prompt_type: refinement.prompt_type,
            excerpt: refinement.excerpt,
            choices: refinement.choices,
            confidence: self.confidence.max(refinement.confidence),
            signal: refinement.signal,
            created_at: self.created_at,
        }
    }

    pub fn fingerprint(&self) -> String {
        excerpt_fingerprint(&self.excerpt)
    }

    /// Shortest unambiguous handle shown to humans.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// Stable digest of an excerpt, used to spot repeated prompts.
pub fn excerpt_fingerprint(excerpt: &str) -> String {
    let normalized: String = excerpt.split_whitespace().collect::<Vec<_>>().join(" ");
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(&digest[..8])
}
