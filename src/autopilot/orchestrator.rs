use std::sync::Arc;

use super::state::{
    AutonomyMode, AutopilotLifecycle, AutopilotSnapshot, AutopilotState, CommandOutcome,
    OperatorCommand,
};
use crate::error::AutopilotError;
use crate::notify::NotificationChannel;
use crate::observability::{Observer, ObserverEvent};
use crate::pipeline::{InjectionGate, ReplySource};
use crate::trust_log::{ChainReport, TrustLogKind, TrustLogs, TrustPayload};

/// Only autonomous replies are gated. A human answer goes through in any
/// lifecycle, kill switch included.
impl InjectionGate for AutopilotState {
    fn admit(&self, source: ReplySource) -> Result<(), String> {
        if source == ReplySource::Human {
            return Ok(());
        }
        let snapshot = self.snapshot();
        match snapshot.lifecycle {
            AutopilotLifecycle::Stopped => Err("stopped".into()),
            AutopilotLifecycle::Paused => Err("paused".into()),
            AutopilotLifecycle::Running if snapshot.mode == AutonomyMode::Off => {
                Err("in off mode".into())
            }
            AutopilotLifecycle::Running => Ok(()),
        }
    }
}

/// Operator control surface over the shared [`AutopilotState`].
///
/// The state change happens first and synchronously; the governance entry
/// is written after it, so a kill switch is already in force while its
/// record is being appended.
pub struct Autopilot {
    state: Arc<AutopilotState>,
    logs: TrustLogs,
    observer: Arc<dyn Observer>,
    alerts: Option<Arc<dyn NotificationChannel>>,
}

impl Autopilot {
    pub fn new(state: Arc<AutopilotState>, logs: TrustLogs, observer: Arc<dyn Observer>) -> Self {
        Self {
            state,
            logs,
            observer,
            alerts: None,
        }
    }

    /// Where integrity halts are announced.
    #[must_use]
    pub fn with_alerts(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.alerts = Some(channel);
        self
    }

    pub fn state(&self) -> &Arc<AutopilotState> {
        &self.state
    }

    pub fn snapshot(&self) -> AutopilotSnapshot {
        self.state.snapshot()
    }

    pub async fn set_mode(&self, mode: AutonomyMode) -> Result<CommandOutcome, AutopilotError> {
        self.command(OperatorCommand::SetMode(mode)).await
    }

    pub async fn pause(&self) -> Result<CommandOutcome, AutopilotError> {
        self.command(OperatorCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<CommandOutcome, AutopilotError> {
        self.command(OperatorCommand::Resume).await
    }

    pub async fn kill_switch(&self) -> Result<CommandOutcome, AutopilotError> {
        self.command(OperatorCommand::KillSwitch).await
    }

    pub async fn restart(&self) -> Result<CommandOutcome, AutopilotError> {
        self.command(OperatorCommand::Restart).await
    }

    /// Fail closed after a storage integrity failure.
    pub async fn halt_for_integrity(
        &self,
        reason: impl Into<String>,
    ) -> Result<CommandOutcome, AutopilotError> {
        let reason = reason.into();
        let outcome = self
            .command(OperatorCommand::IntegrityHalt {
                reason: reason.clone(),
            })
            .await?;
        if outcome.changed
            && let Some(channel) = &self.alerts
            && let Err(error) = channel
                .alert(&format!("autopilot stopped: {reason}"))
                .await
        {
            tracing::warn!(%error, "alert delivery failed");
        }
        Ok(outcome)
    }

    async fn command(&self, command: OperatorCommand) -> Result<CommandOutcome, AutopilotError> {
        let outcome = self.state.apply(command)?;
        let name = outcome.command.name();
        if outcome.changed {
            tracing::warn!(
                command = %name,
                before = %outcome.before.label(),
                after = %outcome.after.label(),
                "autopilot.command"
            );
        } else {
            tracing::info!(command = %name, state = %outcome.after.label(), "autopilot.command_noop");
        }
        self.observer.record_event(&ObserverEvent::OperatorCommand {
            command: name.clone(),
            changed: outcome.changed,
        });
        self.logs
            .record(TrustPayload::Operator {
                command: name,
                before: outcome.before.label(),
                after: outcome.after.label(),
                changed: outcome.changed,
            })
            .await?;
        Ok(outcome)
    }

    /// Re-verify both trust-log chains; any mismatch stops the autopilot.
    pub async fn check_integrity(
        &self,
    ) -> Result<Vec<(TrustLogKind, ChainReport)>, AutopilotError> {
        let reports = match self.logs.verify_all().await {
            Ok(reports) => reports,
            Err(error) => {
                let reason = format!("trust log unreadable: {error}");
                self.halt_for_integrity(reason).await?;
                return Err(error.into());
            }
        };

        let broken: Vec<_> = reports.iter().filter(|(_, r)| !r.valid).collect();
        for (kind, report) in &broken {
            self.observer.record_event(&ObserverEvent::IntegrityFailure {
                log: kind.to_string(),
                first_invalid_step: report.first_invalid_step,
            });
            self.logs
                .record(TrustPayload::Integrity {
                    log: kind.to_string(),
                    valid: false,
                    first_invalid_step: report.first_invalid_step,
                    message: report.message.clone(),
                })
                .await?;
        }
        if let Some((kind, report)) = broken.first() {
            self.halt_for_integrity(format!("{kind} log: {}", report.message))
                .await?;
        }
        Ok(reports)
    }
}
