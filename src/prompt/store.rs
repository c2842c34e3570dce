use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use std::collections::BTreeMap;
use std::time::Duration;

use super::lifecycle::{LifecycleActor, LifecycleState, Transition, check_transition};
use super::types::{PromptEvent, PromptType};
use crate::error::LifecycleError;

const LIFECYCLE_SCHEMA_KEY: &str = "lifecycle_schema_version";
const LIFECYCLE_SCHEMA_VERSION: u32 = 1;
const MAX_CAS_ATTEMPTS: usize = 4;
const TERMINAL_STATES_SQL: &str = "('resolved', 'expired', 'canceled', 'failed')";

/// Persisted view of one prompt and where it is in its lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct PromptRecord {
    pub event: PromptEvent,
    pub state: LifecycleState,
    pub decision_action: Option<String>,
    pub last_reason: Option<String>,
    pub updated_at: String,
}

/// Recent prompt in a session, as seen by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
    pub prompt_id: String,
    pub fingerprint: String,
    pub prompt_type: PromptType,
    pub state: LifecycleState,
}

/// Durable lifecycle table. Every transition is a compare-and-set on the
/// stored state, so concurrent activities can never move one prompt twice
/// from the same state.
#[derive(Clone)]
pub struct SqliteLifecycleStore {
    pool: SqlitePool,
}

impl SqliteLifecycleStore {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        crate::storage::ensure_schema_version(
            &pool,
            LIFECYCLE_SCHEMA_KEY,
            LIFECYCLE_SCHEMA_VERSION,
        )
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS prompt_lifecycles (
                 prompt_id         TEXT PRIMARY KEY,
                 session_id        TEXT NOT NULL,
                 prompt_type       TEXT NOT NULL,
                 fingerprint       TEXT NOT NULL,
                 event_json        TEXT NOT NULL,
                 state             TEXT NOT NULL,
                 decision_action   TEXT,
                 last_reason       TEXT,
                 awaiting_since_ms INTEGER,
                 created_ms        INTEGER NOT NULL,
                 updated_at        TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await
        .context("create prompt_lifecycles table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_prompt_lifecycles_session
                 ON prompt_lifecycles(session_id, created_ms)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS prompt_transitions (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 prompt_id  TEXT NOT NULL REFERENCES prompt_lifecycles(prompt_id),
                 from_state TEXT NOT NULL,
                 to_state   TEXT NOT NULL,
                 actor      TEXT NOT NULL,
                 reason     TEXT,
                 at         TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await
        .context("create prompt_transitions table")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a freshly detected prompt in `CREATED`. Returns `false` if
    /// the identity already exists.
    pub async fn create(&self, event: &PromptEvent) -> Result<bool, LifecycleError> {
        let event_json = encode_event(event)?;
        let result = sqlx::query(
            "INSERT INTO prompt_lifecycles
                 (prompt_id, session_id, prompt_type, fingerprint, event_json, state, created_ms, updated_at)
             VALUES ($1, $2, $3, $4, $5, 'created', $6, $7)
             ON CONFLICT(prompt_id) DO NOTHING",
        )
        .bind(event.id.to_string())
        .bind(&event.session_id)
        .bind(event.prompt_type.to_string())
        .bind(event.fingerprint())
        .bind(event_json)
        .bind(event.created_at.timestamp_millis())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Store a refined event. Only allowed before routing and only when the
    /// refinement is stronger than what is stored.
    pub async fn refine(&self, refined: &PromptEvent) -> Result<bool, LifecycleError> {
        let prompt_id = refined.id.to_string();
        let Some(current) = self.event(&prompt_id).await? else {
            return Err(LifecycleError::UnknownPrompt(prompt_id));
        };
        if current.id != refined.id || !refined.confidence.outranks(current.confidence) {
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE prompt_lifecycles
             SET event_json = $1, prompt_type = $2, fingerprint = $3, updated_at = $4
             WHERE prompt_id = $5 AND state = 'created'",
        )
        .bind(encode_event(refined)?)
        .bind(refined.prompt_type.to_string())
        .bind(refined.fingerprint())
        .bind(Utc::now().to_rfc3339())
        .bind(&prompt_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn state(&self, prompt_id: &str) -> Result<Option<LifecycleState>, LifecycleError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM prompt_lifecycles WHERE prompt_id = $1")
                .bind(prompt_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(raw,)| parse_state(&raw)).transpose()
    }

    pub async fn event(&self, prompt_id: &str) -> Result<Option<PromptEvent>, LifecycleError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT event_json FROM prompt_lifecycles WHERE prompt_id = $1")
                .bind(prompt_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(raw,)| decode_event(&raw)).transpose()
    }

    pub async fn record(&self, prompt_id: &str) -> Result<Option<PromptRecord>, LifecycleError> {
        let row = sqlx::query(
            "SELECT event_json, state, decision_action, last_reason, updated_at
             FROM prompt_lifecycles WHERE prompt_id = $1",
        )
        .bind(prompt_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| map_record_row(&r)).transpose()
    }

    /// Move a prompt to `to`, validating against the transition table and
    /// the actor that owns the edge.
    pub async fn advance(
        &self,
        prompt_id: &str,
        to: LifecycleState,
        actor: LifecycleActor,
        reason: Option<&str>,
    ) -> Result<Transition, LifecycleError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .state(prompt_id)
                .await?
                .ok_or_else(|| LifecycleError::UnknownPrompt(prompt_id.to_string()))?;
            check_transition(prompt_id, current, to, actor)?;

            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE prompt_lifecycles
                 SET state = $1,
                     updated_at = $2,
                     awaiting_since_ms = CASE WHEN $1 = 'awaiting_reply' THEN $3 ELSE awaiting_since_ms END,
                     last_reason = COALESCE($4, last_reason)
                 WHERE prompt_id = $5 AND state = $6",
            )
            .bind(to.to_string())
            .bind(now.to_rfc3339())
            .bind(now.timestamp_millis())
            .bind(reason)
            .bind(prompt_id)
            .bind(current.to_string())
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }

            sqlx::query(
                "INSERT INTO prompt_transitions (prompt_id, from_state, to_state, actor, reason, at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(prompt_id)
            .bind(current.to_string())
            .bind(to.to_string())
            .bind(actor.to_string())
            .bind(reason)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            tracing::debug!(prompt_id, from = %current, to = %to, actor = %actor, "prompt.transition");
            return Ok(Transition {
                from: current,
                to,
                actor,
                reason: reason.map(str::to_string),
                at: now,
            });
        }

        Err(LifecycleError::Contended {
            prompt_id: prompt_id.to_string(),
            to,
        })
    }

    pub async fn set_decision_action(
        &self,
        prompt_id: &str,
        action: &str,
    ) -> Result<(), LifecycleError> {
        sqlx::query("UPDATE prompt_lifecycles SET decision_action = $1 WHERE prompt_id = $2")
            .bind(action)
            .bind(prompt_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Prompts in `AWAITING_REPLY` whose reply deadline has passed.
    pub async fn overdue(
        &self,
        now_ms: i64,
        reply_timeout: Duration,
    ) -> Result<Vec<String>, LifecycleError> {
        let timeout_ms = i64::try_from(reply_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(timeout_ms);
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT prompt_id FROM prompt_lifecycles
             WHERE state = 'awaiting_reply' AND awaiting_since_ms <= $1
             ORDER BY awaiting_since_ms ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn non_terminal(&self, session_id: Option<&str>) -> Result<Vec<String>, LifecycleError> {
        let sql = format!(
            "SELECT prompt_id FROM prompt_lifecycles
             WHERE state NOT IN {TERMINAL_STATES_SQL} AND ($1 IS NULL OR session_id = $1)
             ORDER BY created_ms ASC"
        );
        let rows: Vec<(String,)> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Most recent prompts of a session, newest first.
    pub async fn session_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryItem>, LifecycleError> {
        let rows = sqlx::query(
            "SELECT prompt_id, fingerprint, prompt_type, state
             FROM prompt_lifecycles
             WHERE session_id = $1
             ORDER BY created_ms DESC
             LIMIT $2",
        )
        .bind(session_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let prompt_type: String = row.try_get("prompt_type")?;
                let state: String = row.try_get("state")?;
                Ok(HistoryItem {
                    prompt_id: row.try_get("prompt_id")?,
                    fingerprint: row.try_get("fingerprint")?,
                    prompt_type: prompt_type
                        .parse()
                        .map_err(|_| LifecycleError::Corrupt(format!("prompt type {prompt_type}")))?,
                    state: parse_state(&state)?,
                })
            })
            .collect()
    }

    /// Resolve a full id or a unique id prefix as typed by a human.
    pub async fn resolve_ref(&self, reference: &str) -> Result<Option<String>, LifecycleError> {
        let reference = reference.trim();
        if reference.is_empty() || !reference.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Ok(None);
        }
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT prompt_id FROM prompt_lifecycles WHERE prompt_id LIKE $1 || '%' LIMIT 2",
        )
        .bind(reference.to_ascii_lowercase())
        .fetch_all(&self.pool)
        .await?;
        match rows.as_slice() {
            [(id,)] => Ok(Some(id.clone())),
            _ => Ok(None),
        }
    }

    pub async fn list(
        &self,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PromptRecord>, LifecycleError> {
        let rows = sqlx::query(
            "SELECT event_json, state, decision_action, last_reason, updated_at
             FROM prompt_lifecycles
             WHERE ($1 IS NULL OR session_id = $1)
             ORDER BY created_ms DESC
             LIMIT $2",
        )
        .bind(session_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_record_row).collect()
    }

    pub async fn counts_by_state(
        &self,
        session_id: Option<&str>,
    ) -> Result<BTreeMap<String, i64>, LifecycleError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM prompt_lifecycles
             WHERE ($1 IS NULL OR session_id = $1)
             GROUP BY state",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn transitions(&self, prompt_id: &str) -> Result<Vec<Transition>, LifecycleError> {
        let rows = sqlx::query(
            "SELECT from_state, to_state, actor, reason, at
             FROM prompt_transitions WHERE prompt_id = $1 ORDER BY id ASC",
        )
        .bind(prompt_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let from: String = row.try_get("from_state")?;
                let to: String = row.try_get("to_state")?;
                let actor: String = row.try_get("actor")?;
                let at: String = row.try_get("at")?;
                Ok(Transition {
                    from: parse_state(&from)?,
                    to: parse_state(&to)?,
                    actor: parse_actor(&actor)?,
                    reason: row.try_get("reason")?,
                    at: DateTime::parse_from_rfc3339(&at)
                        .map_err(|e| LifecycleError::Corrupt(format!("transition time: {e}")))?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }
}

fn encode_event(event: &PromptEvent) -> Result<String, LifecycleError> {
    serde_json::to_string(event).map_err(|e| LifecycleError::Corrupt(format!("encode event: {e}")))
}

fn decode_event(raw: &str) -> Result<PromptEvent, LifecycleError> {
    serde_json::from_str(raw).map_err(|e| LifecycleError::Corrupt(format!("decode event: {e}")))
}

fn parse_state(raw: &str) -> Result<LifecycleState, LifecycleError> {
    raw.parse()
        .map_err(|_| LifecycleError::Corrupt(format!("unknown lifecycle state: {raw}")))
}

fn parse_actor(raw: &str) -> Result<LifecycleActor, LifecycleError> {
    match raw {
        "router" => Ok(LifecycleActor::Router),
        "reply_path" => Ok(LifecycleActor::ReplyPath),
        "executor" => Ok(LifecycleActor::Executor),
        "sweeper" => Ok(LifecycleActor::Sweeper),
        "session" => Ok(LifecycleActor::Session),
        _ => Err(LifecycleError::Corrupt(format!("unknown actor: {raw}"))),
    }
}

fn map_record_row(row: &SqliteRow) -> Result<PromptRecord, LifecycleError> {
    let event_raw: String = row.try_get("event_json")?;
    let state_raw: String = row.try_get("state")?;
    Ok(PromptRecord {
        event: decode_event(&event_raw)?,
        state: parse_state(&state_raw)?,
        decision_action: row.try_get("decision_action")?,
        last_reason: row.try_get("last_reason")?,
        updated_at: row.try_get("updated_at")?,
    })
}
