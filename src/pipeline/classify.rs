use serde::{Deserialize, Serialize};
use strum::Display;

use crate::prompt::{HistoryItem, PromptEvent, PromptType};

const DESTRUCTIVE_MARKERS: &[&str] = &[
    "rm -rf",
    "delete",
    "remove",
    "overwrite",
    "drop table",
    "drop database",
    "truncate",
    "force push",
    "push --force",
    "reset --hard",
    "destroy",
    "wipe",
    "format disk",
];

const CREDENTIAL_MARKERS: &[&str] = &[
    "password",
    "passphrase",
    "api key",
    "api_key",
    "access token",
    "secret",
    "one-time code",
    "2fa",
    "verification code",
    "private key",
];

/// Narrower interaction class than the detected prompt type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InteractionClass {
    RoutineConfirmation,
    DestructiveConfirmation,
    CredentialRequest,
    Choice,
    MultiChoice,
    FreeInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub class: InteractionClass,
    /// Earlier prompts in this session with the same excerpt fingerprint.
    pub repeat_count: usize,
}

impl Classification {
    /// A prompt that keeps coming back usually means the previous answer
    /// did not land.
    pub fn is_looping(&self) -> bool {
        self.repeat_count >= 2
    }
}

/// Refine a detected prompt using recent session history. Pure; the event
/// is not touched.
pub fn classify(event: &PromptEvent, history: &[HistoryItem]) -> Classification {
    let lowered = event.excerpt.to_lowercase();
    let credential = CREDENTIAL_MARKERS.iter().any(|m| lowered.contains(m));
    let destructive = DESTRUCTIVE_MARKERS.iter().any(|m| lowered.contains(m));

    let class = if credential {
        InteractionClass::CredentialRequest
    } else {
        match event.prompt_type {
            PromptType::YesNo | PromptType::ConfirmEnter if destructive => {
                InteractionClass::DestructiveConfirmation
            }
            PromptType::YesNo | PromptType::ConfirmEnter => InteractionClass::RoutineConfirmation,
            PromptType::NumberedChoice if destructive => InteractionClass::DestructiveConfirmation,
            PromptType::NumberedChoice => InteractionClass::Choice,
            PromptType::MultiSelect => InteractionClass::MultiChoice,
            PromptType::FreeText => InteractionClass::FreeInput,
        }
    };

    let own_id = event.id.to_string();
    let fingerprint = event.fingerprint();
    let repeat_count = history
        .iter()
        .filter(|item| item.prompt_id != own_id && item.fingerprint == fingerprint)
        .count();

    Classification {
        class,
        repeat_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{Confidence, ConfidenceTier, DetectionSignal, LifecycleState};
    use chrono::Utc;
    use uuid::Uuid;

    fn event(prompt_type: PromptType, excerpt: &str) -> PromptEvent {
        PromptEvent {
            id: Uuid::new_v4(),
            session_id: "s1".into(),
            prompt_type,
            excerpt: excerpt.into(),
            choices: Vec::new(),
            confidence: Confidence::new(ConfidenceTier::High, 0.9),
            signal: DetectionSignal::Pattern {
                matcher: "test".into(),
            },
            created_at: Utc::now(),
        }
    }

    fn seen(excerpt: &str) -> HistoryItem {
        HistoryItem {
            prompt_id: Uuid::new_v4().to_string(),
            fingerprint: crate::prompt::excerpt_fingerprint(excerpt),
            prompt_type: PromptType::YesNo,
            state: LifecycleState::Resolved,
        }
    }

    #[test]
    fn destructive_confirmation_is_told_apart() {
        let routine = classify(&event(PromptType::YesNo, "Create src/lib.rs? [y/n]"), &[]);
        assert_eq!(routine.class, InteractionClass::RoutineConfirmation);

        let destructive = classify(&event(PromptType::YesNo, "Run rm -rf target? [y/n]"), &[]);
        assert_eq!(destructive.class, InteractionClass::DestructiveConfirmation);
    }

    #[test]
    fn credential_requests_win_over_type() {
        let c = classify(&event(PromptType::FreeText, "Enter your GitHub password:"), &[]);
        assert_eq!(c.class, InteractionClass::CredentialRequest);
    }

    #[test]
    fn repeats_are_counted_from_history_excluding_self() {
        let ev = event(PromptType::YesNo, "Retry upload? [y/n]");
        let mut own = seen("Retry upload? [y/n]");
        own.prompt_id = ev.id.to_string();
        let history = vec![
            seen("Retry upload? [y/n]"),
            seen("Retry upload? [y/n]"),
            seen("Something else"),
            own,
        ];
        let c = classify(&ev, &history);
        assert_eq!(c.repeat_count, 2);
        assert!(c.is_looping());
    }
}
