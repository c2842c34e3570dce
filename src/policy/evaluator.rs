use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::matcher::{MatchOutcome, MatchPool, PatternEngine, RegexEngine};
use super::rules::{DEFAULT_RULE_ID, PolicyRule, RuleAction, RuleSet};
use super::trackers::RuleRateLimiter;
use crate::prompt::{Confidence, PromptEvent};

/// What the evaluator knows about the session a prompt came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tags: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub prompt_id: Uuid,
    /// Matched rule, or `"default"` when nothing matched.
    pub rule_id: String,
    pub action: RuleAction,
    /// Literal reply configured on the rule, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    /// The matched rule named the prompt text through `any_of`.
    #[serde(default)]
    pub content_match: bool,
    pub explanation: String,
    pub confidence: Confidence,
    pub evaluated_at: DateTime<Utc>,
}

impl PolicyDecision {
    pub fn is_default(&self) -> bool {
        self.rule_id == DEFAULT_RULE_ID
    }
}

/// Non-fatal oddities seen while evaluating; recorded, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "anomaly", rename_all = "snake_case")]
pub enum PolicyAnomaly {
    MatchTimeout { rule_id: String, elapsed_ms: u64 },
    MatchFailed { rule_id: String, reason: String },
    RateLimited { rule_id: String },
    NoMatch,
}

impl PolicyAnomaly {
    pub fn rule_id(&self) -> &str {
        match self {
            Self::MatchTimeout { rule_id, .. }
            | Self::MatchFailed { rule_id, .. }
            | Self::RateLimited { rule_id } => rule_id,
            Self::NoMatch => DEFAULT_RULE_ID,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::MatchTimeout {
                rule_id,
                elapsed_ms,
            } => format!("rule '{rule_id}' pattern match exceeded its timeout ({elapsed_ms}ms); skipped"),
            Self::MatchFailed { rule_id, reason } => {
                format!("rule '{rule_id}' pattern match failed: {reason}; skipped")
            }
            Self::RateLimited { rule_id } => {
                format!("rule '{rule_id}' rate limit exhausted; skipped")
            }
            Self::NoMatch => "no rule matched".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: PolicyDecision,
    pub anomalies: Vec<PolicyAnomaly>,
}

const MATCH_WORKERS: usize = 4;

/// First-match-wins evaluation over an ordered ruleset.
///
/// Rule state never changes during a pass. The only state the evaluator
/// carries across passes is per-rule rate-limit usage.
pub struct PolicyEvaluator {
    engine: Arc<dyn PatternEngine>,
    pool: MatchPool,
    match_timeout: Duration,
    limiter: RuleRateLimiter,
}

impl PolicyEvaluator {
    pub fn new(match_timeout: Duration) -> Self {
        Self::with_engine(Arc::new(RegexEngine), match_timeout)
    }

    pub fn with_engine(engine: Arc<dyn PatternEngine>, match_timeout: Duration) -> Self {
        Self {
            engine,
            pool: MatchPool::new(MATCH_WORKERS),
            match_timeout,
            limiter: RuleRateLimiter::new(),
        }
    }

    pub fn evaluate(
        &self,
        event: &PromptEvent,
        rules: &RuleSet,
        ctx: &SessionContext,
    ) -> Evaluation {
        self.evaluate_at(event, rules, ctx, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        event: &PromptEvent,
        rules: &RuleSet,
        ctx: &SessionContext,
        evaluated_at: DateTime<Utc>,
    ) -> Evaluation {
        let mut anomalies = Vec::new();
        let haystack: Arc<str> = Arc::from(event.excerpt.as_str());

        for rule in rules.rules() {
            if !static_criteria_match(rule, event, ctx) {
                continue;
            }

            if rule.has_patterns() {
                match self.pool.run(
                    Arc::clone(&self.engine),
                    Arc::clone(&rule.any_of),
                    Arc::clone(&rule.none_of),
                    Arc::clone(&haystack),
                    self.match_timeout,
                ) {
                    MatchOutcome::Matched => {}
                    MatchOutcome::NotMatched => continue,
                    MatchOutcome::TimedOut { elapsed } => {
                        let anomaly = PolicyAnomaly::MatchTimeout {
                            rule_id: rule.id.clone(),
                            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                        };
                        tracing::warn!(prompt_id = %event.id, rule_id = %rule.id, "policy.anomaly: match timeout");
                        anomalies.push(anomaly);
                        continue;
                    }
                    MatchOutcome::Failed(reason) => {
                        tracing::warn!(prompt_id = %event.id, rule_id = %rule.id, %reason, "policy.anomaly: match failed");
                        anomalies.push(PolicyAnomaly::MatchFailed {
                            rule_id: rule.id.clone(),
                            reason,
                        });
                        continue;
                    }
                }
            }

            if let Some(limit) = rule.rate_limit
                && !self.limiter.try_acquire(&rule.id, limit, Instant::now())
            {
                tracing::info!(prompt_id = %event.id, rule_id = %rule.id, "policy.anomaly: rate limited");
                anomalies.push(PolicyAnomaly::RateLimited {
                    rule_id: rule.id.clone(),
                });
                continue;
            }

            let decision = PolicyDecision {
                prompt_id: event.id,
                rule_id: rule.id.clone(),
                action: rule.action,
                reply: rule.reply.clone(),
                content_match: !rule.any_of.is_empty(),
                explanation: explain_match(rule, event),
                confidence: event.confidence,
                evaluated_at,
            };
            tracing::debug!(prompt_id = %event.id, rule_id = %rule.id, action = %rule.action, "policy.matched");
            return Evaluation {
                decision,
                anomalies,
            };
        }

        anomalies.push(PolicyAnomaly::NoMatch);
        Evaluation {
            decision: default_decision(event, evaluated_at, &anomalies),
            anomalies,
        }
    }
}

fn static_criteria_match(rule: &PolicyRule, event: &PromptEvent, ctx: &SessionContext) -> bool {
    if !rule.prompt_types.is_empty() && !rule.prompt_types.contains(&event.prompt_type) {
        return false;
    }
    let tier = event.confidence.tier;
    if rule.min_confidence.is_some_and(|min| tier < min)
        || rule.max_confidence.is_some_and(|max| tier > max)
    {
        return false;
    }
    if let Some(tag) = &rule.session_tag
        && !ctx.tags.contains(tag)
    {
        return false;
    }
    true
}

fn explain_match(rule: &PolicyRule, event: &PromptEvent) -> String {
    let mut text = format!(
        "rule '{}' matched {} prompt at {} confidence",
        rule.id, event.prompt_type, event.confidence.tier
    );
    if let Some(parent) = &rule.extends {
        text.push_str(&format!(" (extends '{parent}')"));
    }
    if let Some(description) = &rule.description {
        text.push_str(": ");
        text.push_str(description);
    }
    text
}

fn default_decision(
    event: &PromptEvent,
    evaluated_at: DateTime<Utc>,
    anomalies: &[PolicyAnomaly],
) -> PolicyDecision {
    let skipped = anomalies
        .iter()
        .filter(|a| !matches!(a, PolicyAnomaly::NoMatch))
        .count();
    let explanation = if skipped == 0 {
        "no rule matched; escalating by default".to_string()
    } else {
        format!("no rule matched ({skipped} skipped by anomalies); escalating by default")
    };
    PolicyDecision {
        prompt_id: event.id,
        rule_id: DEFAULT_RULE_ID.to_string(),
        action: RuleAction::Escalate,
        reply: None,
        content_match: false,
        explanation,
        confidence: event.confidence,
        evaluated_at,
    }
}
