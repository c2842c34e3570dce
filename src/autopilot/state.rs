use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use strum::{Display, EnumString};

use crate::error::AutopilotError;

/// How much the autopilot may do without a human.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AutonomyMode {
    Off,
    #[default]
    Assist,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AutopilotLifecycle {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopilotSnapshot {
    pub lifecycle: AutopilotLifecycle,
    pub mode: AutonomyMode,
    pub changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl AutopilotSnapshot {
    /// Compact `lifecycle/mode` label used in trust-log entries.
    pub fn label(&self) -> String {
        format!("{}/{}", self.lifecycle, self.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    SetMode(AutonomyMode),
    Pause,
    Resume,
    KillSwitch,
    Restart,
    IntegrityHalt { reason: String },
}

impl OperatorCommand {
    pub fn name(&self) -> String {
        match self {
            Self::SetMode(mode) => format!("set_mode:{mode}"),
            Self::Pause => "pause".into(),
            Self::Resume => "resume".into(),
            Self::KillSwitch => "kill_switch".into(),
            Self::Restart => "restart".into(),
            Self::IntegrityHalt { .. } => "integrity_halt".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: OperatorCommand,
    pub before: AutopilotSnapshot,
    pub after: AutopilotSnapshot,
    pub changed: bool,
}

/// The single process-wide autopilot state object.
///
/// Every mutation goes through [`AutopilotState::apply`], which holds the
/// lock for the whole read-modify-write, so a kill switch is visible to the
/// very next [`AutopilotState::snapshot`] on any thread.
#[derive(Debug)]
pub struct AutopilotState {
    inner: Mutex<AutopilotSnapshot>,
}

impl AutopilotState {
    pub fn new(mode: AutonomyMode) -> Self {
        Self {
            inner: Mutex::new(AutopilotSnapshot {
                lifecycle: AutopilotLifecycle::Running,
                mode,
                changed_at: Utc::now(),
                stop_reason: None,
            }),
        }
    }

    /// Start already stopped, e.g. after a failed integrity check.
    pub fn stopped(mode: AutonomyMode, reason: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(AutopilotSnapshot {
                lifecycle: AutopilotLifecycle::Stopped,
                mode,
                changed_at: Utc::now(),
                stop_reason: Some(reason.into()),
            }),
        }
    }

    pub fn snapshot(&self) -> AutopilotSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lifecycle(&self) -> AutopilotLifecycle {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lifecycle
    }

    pub fn mode(&self) -> AutonomyMode {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).mode
    }

    /// Apply one operator command. Repeating a command is a no-op
    /// (`changed == false`); pausing or resuming a stopped autopilot is
    /// refused.
    pub fn apply(&self, command: OperatorCommand) -> Result<CommandOutcome, AutopilotError> {
        use AutopilotLifecycle as L;

        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = guard.clone();
        let mut next = before.clone();

        match &command {
            OperatorCommand::SetMode(mode) => next.mode = *mode,
            OperatorCommand::Pause => match before.lifecycle {
                L::Running | L::Paused => next.lifecycle = L::Paused,
                L::Stopped => return Err(AutopilotError::Stopped("pause")),
            },
            OperatorCommand::Resume => match before.lifecycle {
                L::Running | L::Paused => next.lifecycle = L::Running,
                L::Stopped => return Err(AutopilotError::Stopped("resume")),
            },
            OperatorCommand::KillSwitch => {
                if before.lifecycle != L::Stopped {
                    next.lifecycle = L::Stopped;
                    next.stop_reason = Some("kill_switch".into());
                }
            }
            OperatorCommand::IntegrityHalt { reason } => {
                if before.lifecycle != L::Stopped {
                    next.lifecycle = L::Stopped;
                    next.stop_reason = Some(format!("integrity: {reason}"));
                }
            }
            OperatorCommand::Restart => {
                if before.lifecycle == L::Stopped {
                    next.lifecycle = L::Running;
                    next.stop_reason = None;
                }
            }
        }

        let changed = next.lifecycle != before.lifecycle || next.mode != before.mode;
        if changed {
            next.changed_at = Utc::now();
            *guard = next;
        }
        Ok(CommandOutcome {
            command,
            before,
            after: guard.clone(),
            changed,
        })
    }
}
