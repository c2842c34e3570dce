use std::sync::Arc;

use super::lifecycle::{LifecycleActor, LifecycleState, Transition};
use super::store::SqliteLifecycleStore;
use crate::error::LifecycleError;
use crate::observability::{Observer, ObserverEvent};
use crate::trust_log::{TrustLogs, TrustPayload};

/// Lifecycle store plus the audit trail every transition leaves behind.
#[derive(Clone)]
pub struct LifecycleLedger {
    store: SqliteLifecycleStore,
    logs: TrustLogs,
    observer: Arc<dyn Observer>,
}

impl LifecycleLedger {
    pub fn new(store: SqliteLifecycleStore, logs: TrustLogs, observer: Arc<dyn Observer>) -> Self {
        Self {
            store,
            logs,
            observer,
        }
    }

    pub fn store(&self) -> &SqliteLifecycleStore {
        &self.store
    }

    pub fn logs(&self) -> &TrustLogs {
        &self.logs
    }

    pub fn observer(&self) -> &Arc<dyn Observer> {
        &self.observer
    }

    /// Advance and record. A failed audit append is logged, not returned:
    /// the transition itself already happened.
    pub async fn advance(
        &self,
        prompt_id: &str,
        to: LifecycleState,
        actor: LifecycleActor,
        reason: Option<&str>,
    ) -> Result<Transition, LifecycleError> {
        let transition = self.store.advance(prompt_id, to, actor, reason).await?;

        let payload = TrustPayload::Lifecycle {
            prompt_id: prompt_id.to_string(),
            from: transition.from.to_string(),
            to: transition.to.to_string(),
            actor: actor.to_string(),
            reason: transition.reason.clone(),
        };
        if let Err(error) = self.logs.record(payload).await {
            tracing::error!(prompt_id, %error, "audit.write_failed");
        }
        self.observer.record_event(&ObserverEvent::LifecycleTransition {
            from: transition.from.to_string(),
            to: transition.to.to_string(),
        });
        tracing::debug!(prompt_id, from = %transition.from, to = %transition.to, %actor, "prompt.transition");
        Ok(transition)
    }

    /// Best-effort move to a terminal state; a prompt that is already
    /// terminal is left alone.
    pub async fn finish(
        &self,
        prompt_id: &str,
        to: LifecycleState,
        actor: LifecycleActor,
        reason: &str,
    ) -> Option<Transition> {
        match self.advance(prompt_id, to, actor, Some(reason)).await {
            Ok(transition) => Some(transition),
            Err(LifecycleError::AlreadyTerminal { state, .. }) => {
                tracing::debug!(prompt_id, %state, "prompt already terminal");
                None
            }
            Err(error) => {
                tracing::warn!(prompt_id, %error, "prompt.finish_failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::NoopObserver;
    use crate::prompt::{Confidence, ConfidenceTier, DetectionSignal, PromptEvent, PromptType};
    use crate::storage::open_memory_pool;
    use chrono::Utc;
    use uuid::Uuid;

    async fn ledger() -> LifecycleLedger {
        let pool = open_memory_pool().await.unwrap();
        let store = SqliteLifecycleStore::new(pool).await.unwrap();
        let logs = TrustLogs::in_memory().await.unwrap();
        LifecycleLedger::new(store, logs, Arc::new(NoopObserver))
    }

    fn event() -> PromptEvent {
        PromptEvent {
            id: Uuid::new_v4(),
            session_id: "s1".into(),
            prompt_type: PromptType::YesNo,
            excerpt: "ok? [y/n]".into(),
            choices: Vec::new(),
            confidence: Confidence::new(ConfidenceTier::High, 0.95),
            signal: DetectionSignal::Pattern {
                matcher: "yes_no".into(),
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn transitions_land_in_the_audit_log() {
        let ledger = ledger().await;
        let ev = event();
        let id = ev.id.to_string();
        ledger.store().create(&ev).await.unwrap();
        ledger
            .advance(&id, LifecycleState::Routed, LifecycleActor::Router, Some("assist"))
            .await
            .unwrap();

        let entries = ledger.logs().audit().entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].content.contains("\"kind\":\"lifecycle\""));
        assert!(entries[0].content.contains("\"to\":\"routed\""));
        assert!(ledger.logs().governance().entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_is_quiet_on_terminal_prompts() {
        let ledger = ledger().await;
        let ev = event();
        let id = ev.id.to_string();
        ledger.store().create(&ev).await.unwrap();
        assert!(
            ledger
                .finish(&id, LifecycleState::Expired, LifecycleActor::Sweeper, "timeout")
                .await
                .is_some()
        );
        assert!(
            ledger
                .finish(&id, LifecycleState::Canceled, LifecycleActor::Session, "stop")
                .await
                .is_none()
        );
        assert_eq!(
            ledger.store().state(&id).await.unwrap(),
            Some(LifecycleState::Expired)
        );
    }
}
