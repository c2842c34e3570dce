//! Read-only view over prompt lifecycles and the autopilot.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::autopilot::AutopilotSnapshot;
use crate::error::LifecycleError;
use crate::prompt::{ConfidenceTier, LifecycleState, PromptRecord, PromptType, SqliteLifecycleStore};

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptStatus {
    pub id: String,
    pub session: String,
    pub prompt_type: PromptType,
    pub tier: ConfidenceTier,
    pub score: f64,
    pub state: LifecycleState,
    pub decision_action: Option<String>,
    pub updated_at: String,
}

impl From<PromptRecord> for PromptStatus {
    fn from(record: PromptRecord) -> Self {
        Self {
            id: record.event.id.to_string(),
            session: record.event.session_id,
            prompt_type: record.event.prompt_type,
            tier: record.event.confidence.tier,
            score: record.event.confidence.score,
            state: record.state,
            decision_action: record.decision_action,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autopilot: Option<AutopilotSnapshot>,
    /// Prompt counts keyed by lifecycle state name.
    pub counts: BTreeMap<String, i64>,
    /// Newest first.
    pub prompts: Vec<PromptStatus>,
}

impl StatusReport {
    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "◆ promptwarden status");
        match &self.autopilot {
            Some(snapshot) => {
                let _ = write!(out, "  autopilot  {}", snapshot.label());
                if let Some(reason) = &snapshot.stop_reason {
                    let _ = write!(out, " ({reason})");
                }
                out.push('\n');
            }
            None => out.push_str("  autopilot  not running\n"),
        }
        let counts = if self.counts.is_empty() {
            "none".to_string()
        } else {
            self.counts
                .iter()
                .map(|(state, n)| format!("{state}={n}"))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let _ = writeln!(out, "  prompts    {} ({counts})", self.total());
        if !self.prompts.is_empty() {
            out.push('\n');
        }
        for p in &self.prompts {
            let _ = writeln!(
                out,
                "  {:<8}  {:<14} {:<15} {:<6} {:.2}  {:<8}  {}",
                p.id.get(..8).unwrap_or(&p.id),
                p.state.to_string(),
                p.prompt_type.to_string(),
                p.tier.to_string(),
                p.score,
                p.decision_action.as_deref().unwrap_or("-"),
                p.session,
            );
        }
        out
    }
}

/// Status query, optionally scoped to one session.
pub struct StatusQuery<'a> {
    store: &'a SqliteLifecycleStore,
    autopilot: Option<AutopilotSnapshot>,
    session: Option<String>,
    limit: usize,
}

impl<'a> StatusQuery<'a> {
    pub fn new(store: &'a SqliteLifecycleStore) -> Self {
        Self {
            store,
            autopilot: None,
            session: None,
            limit: DEFAULT_LIMIT,
        }
    }

    pub fn with_autopilot(mut self, snapshot: AutopilotSnapshot) -> Self {
        self.autopilot = Some(snapshot);
        self
    }

    pub fn session(mut self, session: Option<impl Into<String>>) -> Self {
        self.session = session.map(Into::into);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub async fn run(self) -> Result<StatusReport, LifecycleError> {
        let session = self.session.as_deref();
        let counts = self.store.counts_by_state(session).await?;
        let prompts = self
            .store
            .list(session, self.limit)
            .await?
            .into_iter()
            .map(PromptStatus::from)
            .collect();
        Ok(StatusReport {
            autopilot: self.autopilot,
            counts,
            prompts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autopilot::{AutonomyMode, AutopilotState};
    use crate::prompt::{Confidence, DetectionSignal, LifecycleActor, PromptEvent};
    use crate::storage::open_memory_pool;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(session: &str) -> PromptEvent {
        PromptEvent {
            id: Uuid::new_v4(),
            session_id: session.into(),
            prompt_type: PromptType::YesNo,
            excerpt: "Proceed? [y/n]".into(),
            choices: Vec::new(),
            confidence: Confidence::new(ConfidenceTier::High, 0.95),
            signal: DetectionSignal::Pattern {
                matcher: "yes_no".into(),
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn report_scopes_to_session() {
        let store = SqliteLifecycleStore::new(open_memory_pool().await.unwrap())
            .await
            .unwrap();
        let a = event("alpha");
        let b = event("beta");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        store
            .advance(
                &b.id.to_string(),
                LifecycleState::Canceled,
                LifecycleActor::Session,
                Some("stop"),
            )
            .await
            .unwrap();

        let all = StatusQuery::new(&store).run().await.unwrap();
        assert_eq!(all.total(), 2);
        assert_eq!(all.prompts.len(), 2);

        let beta = StatusQuery::new(&store)
            .session(Some("beta"))
            .run()
            .await
            .unwrap();
        assert_eq!(beta.prompts.len(), 1);
        assert_eq!(beta.prompts[0].state, LifecycleState::Canceled);
        assert_eq!(beta.counts.get("canceled"), Some(&1));
    }

    #[tokio::test]
    async fn render_includes_autopilot_and_prompt_rows() {
        let store = SqliteLifecycleStore::new(open_memory_pool().await.unwrap())
            .await
            .unwrap();
        let ev = event("alpha");
        store.create(&ev).await.unwrap();
        let state = AutopilotState::new(AutonomyMode::Full);

        let text = StatusQuery::new(&store)
            .with_autopilot(state.snapshot())
            .run()
            .await
            .unwrap()
            .render();
        assert!(text.contains("running/full"));
        assert!(text.contains(&ev.short_id()));
        assert!(text.contains("created=1"));
    }
}
