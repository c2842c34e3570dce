use std::sync::Arc;
use tokio::time::{Instant, sleep};

use super::plan::{ExecutionPlan, PlannedAction, ReplySource, RetryPolicy};
use crate::error::{ExecutionError, LifecycleError};
use crate::notify::NotificationChannel;
use crate::observability::{ObserverEvent, ObserverMetric};
use crate::process::ProcessSupervisor;
use crate::prompt::{LifecycleActor, LifecycleLedger, LifecycleState};
use crate::trust_log::TrustPayload;

/// Consulted immediately before every write. `Err` carries a short
/// description of why injection is not allowed right now.
pub trait InjectionGate: Send + Sync {
    fn admit(&self, source: ReplySource) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionReport {
    pub attempts: u32,
}

/// Writes a planned reply into the supervised process and checks that the
/// process moved past the prompt.
pub struct Executor {
    supervisor: Arc<dyn ProcessSupervisor>,
    ledger: LifecycleLedger,
    gate: Arc<dyn InjectionGate>,
    notifier: Arc<dyn NotificationChannel>,
}

impl Executor {
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        ledger: LifecycleLedger,
        gate: Arc<dyn InjectionGate>,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        Self {
            supervisor,
            ledger,
            gate,
            notifier,
        }
    }

    /// Carry out an injection plan for a prompt in `reply_received`.
    ///
    /// Ends in `resolved` on success. A closed gate, a final write error or
    /// exhausted verification ends in `failed` with an operator alert.
    pub async fn execute(&self, plan: &ExecutionPlan) -> Result<ExecutionReport, ExecutionError> {
        let prompt_id = plan.prompt_id.to_string();
        let PlannedAction::Inject { payload } = &plan.action else {
            return Err(ExecutionError::NothingToInject(prompt_id));
        };

        match self.ledger.store().state(&prompt_id).await? {
            Some(LifecycleState::ReplyReceived) => {}
            Some(state) => return Err(ExecutionError::NotReady { prompt_id, state }),
            None => return Err(LifecycleError::UnknownPrompt(prompt_id).into()),
        }

        let retry = plan.retry;
        let mut injected = false;
        for attempt in 1..=retry.max_attempts {
            if let Err(autopilot) = self.gate.admit(plan.source) {
                self.record_attempt(&prompt_id, attempt, &format!("aborted: autopilot {autopilot}"))
                    .await;
                self.fail(&prompt_id, &format!("injection aborted: autopilot {autopilot}"))
                    .await;
                tracing::warn!(prompt_id = %prompt_id, attempt, %autopilot, "injection.aborted");
                return Err(ExecutionError::KillSwitch {
                    prompt_id,
                    autopilot,
                });
            }

            let watermark = self.supervisor.output_watermark();
            if let Err(source) = self.supervisor.write(payload.as_bytes()).await {
                self.record_attempt(&prompt_id, attempt, &format!("write_failed: {source}"))
                    .await;
                if attempt == retry.max_attempts {
                    self.fail(&prompt_id, &format!("could not write reply: {source}"))
                        .await;
                    return Err(ExecutionError::Write { prompt_id, source });
                }
                sleep(retry.backoff_after(attempt)).await;
                continue;
            }

            if !injected {
                self.ledger
                    .advance(
                        &prompt_id,
                        LifecycleState::Injected,
                        LifecycleActor::Executor,
                        Some(&format!("{} reply written", plan.source)),
                    )
                    .await?;
                injected = true;
            }

            if self.verify(watermark, &retry).await {
                self.record_attempt(&prompt_id, attempt, "verified").await;
                self.ledger
                    .advance(
                        &prompt_id,
                        LifecycleState::Resolved,
                        LifecycleActor::Executor,
                        Some("process advanced"),
                    )
                    .await?;
                self.ledger
                    .observer()
                    .record_metric(&ObserverMetric::InjectionAttempts(u64::from(attempt)));
                return Ok(ExecutionReport { attempts: attempt });
            }

            self.record_attempt(&prompt_id, attempt, "unverified").await;
            if attempt < retry.max_attempts {
                sleep(retry.backoff_after(attempt)).await;
            }
        }

        let attempts = retry.max_attempts;
        self.fail(
            &prompt_id,
            &format!("process did not advance after {attempts} injection attempts"),
        )
        .await;
        self.ledger
            .observer()
            .record_metric(&ObserverMetric::InjectionAttempts(u64::from(attempts)));
        Err(ExecutionError::VerificationExhausted {
            prompt_id,
            attempts,
        })
    }

    /// The process counts as advanced once it produced new output or is no
    /// longer parked on a read.
    async fn verify(&self, watermark: u64, retry: &RetryPolicy) -> bool {
        let deadline = Instant::now() + retry.verify_timeout;
        loop {
            if self.supervisor.output_watermark() != watermark
                || !self.supervisor.is_blocked_on_read().await
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(retry.verify_poll).await;
        }
    }

    async fn record_attempt(&self, prompt_id: &str, attempt: u32, outcome: &str) {
        let payload = TrustPayload::Injection {
            prompt_id: prompt_id.to_string(),
            attempt,
            outcome: outcome.to_string(),
        };
        if let Err(error) = self.ledger.logs().record(payload).await {
            tracing::error!(prompt_id, %error, "audit.write_failed");
        }
        self.ledger
            .observer()
            .record_event(&ObserverEvent::InjectionAttempt {
                attempt,
                outcome: outcome.to_string(),
            });
        tracing::info!(prompt_id, attempt, outcome, "injection.attempt");
    }

    async fn fail(&self, prompt_id: &str, message: &str) {
        self.ledger
            .finish(
                prompt_id,
                LifecycleState::Failed,
                LifecycleActor::Executor,
                message,
            )
            .await;
        let alert = TrustPayload::Alert {
            prompt_id: Some(prompt_id.to_string()),
            message: message.to_string(),
        };
        if let Err(error) = self.ledger.logs().record(alert).await {
            tracing::error!(prompt_id, %error, "audit.write_failed");
        }
        if let Err(error) = self
            .notifier
            .alert(&format!("prompt {prompt_id}: {message}"))
            .await
        {
            tracing::warn!(prompt_id, %error, "alert delivery failed");
        }
    }
}
