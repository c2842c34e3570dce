use serde::{Deserialize, Serialize};

use crate::prompt::{Choice, PromptEvent, PromptType};

/// A normalized human (or rule) answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum ReplyValue {
    Affirmative,
    Negative,
    /// Drop the prompt without answering it.
    Cancel,
    Choice(u32),
    Literal(String),
}

impl ReplyValue {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "y" | "yes" | "approve" | "allow" | "ok" => return Self::Affirmative,
            "n" | "no" | "deny" | "reject" => return Self::Negative,
            "cancel" => return Self::Cancel,
            _ => {}
        }
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if !digits.is_empty()
            && digits.bytes().all(|b| b.is_ascii_digit())
            && let Ok(number) = digits.parse::<u32>()
        {
            return Self::Choice(number);
        }
        Self::Literal(raw.trim_end_matches(['\r', '\n']).to_string())
    }
}

const AFFIRMATIVE_LABELS: &[&str] = &["yes", "allow", "approve", "proceed", "continue", "accept"];
const NEGATIVE_LABELS: &[&str] = &["no", "deny", "reject", "cancel", "decline", "abort"];

/// Keystrokes (without the trailing newline) that say "yes" to this prompt.
pub fn affirmative_text(event: &PromptEvent) -> Option<String> {
    match event.prompt_type {
        PromptType::YesNo => Some("y".into()),
        PromptType::ConfirmEnter => Some(String::new()),
        PromptType::NumberedChoice => pick_choice(&event.choices, AFFIRMATIVE_LABELS),
        PromptType::MultiSelect | PromptType::FreeText => None,
    }
}

/// Keystrokes that say "no" to this prompt, when it has a way to decline.
pub fn negative_text(event: &PromptEvent) -> Option<String> {
    match event.prompt_type {
        PromptType::YesNo => Some("n".into()),
        PromptType::NumberedChoice => pick_choice(&event.choices, NEGATIVE_LABELS),
        PromptType::ConfirmEnter | PromptType::MultiSelect | PromptType::FreeText => None,
    }
}

fn pick_choice(choices: &[Choice], words: &[&str]) -> Option<String> {
    choices
        .iter()
        .find(|choice| {
            let label = choice.label.to_ascii_lowercase();
            label
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| words.contains(&token))
        })
        .map(|choice| choice.number.to_string())
}
