use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::Display;
use uuid::Uuid;

use super::classify::{Classification, InteractionClass};
use super::reply::{ReplyValue, affirmative_text, negative_text};
use crate::config::PipelineConfig;
use crate::policy::{PolicyDecision, RuleAction};
use crate::prompt::PromptEvent;

/// Who the reply being injected came from. The executor gates the two
/// differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReplySource {
    Policy,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub verify_timeout: Duration,
    pub verify_poll: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_injection_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            verify_timeout: Duration::from_millis(config.verify_timeout_ms),
            verify_poll: Duration::from_millis(config.verify_poll_ms.max(1)),
        }
    }

    /// Delay after a failed `attempt` (1-based): doubles from the initial
    /// backoff, capped.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// Write `payload` (already newline-terminated) to the process.
    Inject { payload: String },
    /// Hand the prompt to a human instead.
    Escalate { reason: String },
    /// Drop the prompt without injecting anything.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub prompt_id: Uuid,
    pub source: ReplySource,
    pub action: PlannedAction,
    pub retry: RetryPolicy,
}

impl ExecutionPlan {
    pub fn is_injection(&self) -> bool {
        matches!(self.action, PlannedAction::Inject { .. })
    }

    /// Reply text without the terminating newline, for logs.
    pub fn reply_text(&self) -> Option<&str> {
        match &self.action {
            PlannedAction::Inject { payload } => Some(payload.trim_end_matches('\n')),
            _ => None,
        }
    }
}

fn inject(text: &str) -> PlannedAction {
    PlannedAction::Inject {
        payload: format!("{text}\n"),
    }
}

fn escalate(reason: impl Into<String>) -> PlannedAction {
    PlannedAction::Escalate {
        reason: reason.into(),
    }
}

/// Plan the policy's answer to a prompt.
///
/// Anything the planner cannot answer with certainty becomes an
/// escalation: credential requests, prompts that keep repeating,
/// destructive confirmations allowed by a rule that never looked at the
/// prompt text, and prompt shapes with no unambiguous yes/no keystroke.
pub fn plan_for_policy(
    event: &PromptEvent,
    classification: &Classification,
    decision: &PolicyDecision,
    retry: RetryPolicy,
) -> ExecutionPlan {
    let action = match decision.action {
        RuleAction::Escalate | RuleAction::RequireHuman => escalate(decision.explanation.clone()),
        _ if classification.class == InteractionClass::CredentialRequest => {
            escalate("prompt asks for a credential")
        }
        RuleAction::Allow
            if classification.class == InteractionClass::DestructiveConfirmation
                && !decision.content_match =>
        {
            escalate(format!(
                "destructive confirmation; rule '{}' does not name it",
                decision.rule_id
            ))
        }
        _ if classification.is_looping() => escalate(format!(
            "prompt seen {} times before in this session",
            classification.repeat_count
        )),
        _ if decision.reply.is_some() => inject(decision.reply.as_deref().unwrap_or_default()),
        RuleAction::Allow => affirmative_text(event).map_or_else(
            || escalate(format!("no automatic yes for a {} prompt", event.prompt_type)),
            |text| inject(&text),
        ),
        RuleAction::Deny => negative_text(event).map_or_else(
            || escalate(format!("no automatic no for a {} prompt", event.prompt_type)),
            |text| inject(&text),
        ),
    };

    ExecutionPlan {
        prompt_id: event.id,
        source: ReplySource::Policy,
        action,
        retry,
    }
}

/// Plan a human's answer. Humans are trusted to mean what they type, so
/// anything without a mapping is sent literally.
pub fn plan_for_reply(
    event: &PromptEvent,
    reply: &ReplyValue,
    retry: RetryPolicy,
) -> ExecutionPlan {
    let action = match reply {
        ReplyValue::Cancel => PlannedAction::Cancel,
        ReplyValue::Affirmative => inject(&affirmative_text(event).unwrap_or_else(|| "y".into())),
        ReplyValue::Negative => inject(&negative_text(event).unwrap_or_else(|| "n".into())),
        ReplyValue::Choice(number) => inject(&number.to_string()),
        ReplyValue::Literal(text) => inject(text),
    };

    ExecutionPlan {
        prompt_id: event.id,
        source: ReplySource::Human,
        action,
        retry,
    }
}
