use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqlitePool;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{DecisionOrigin, DecisionOutcome};
use crate::error::DecisionStoreError;

const DECISION_SCHEMA_KEY: &str = "decision_schema_version";
const DECISION_SCHEMA_VERSION: u32 = 1;
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Durable decision records.
///
/// The guard is a claim row inserted with `ON CONFLICT DO NOTHING`: the
/// insert is the atomic check-and-set, so exactly one caller per prompt
/// ever runs its computation, across tasks and across processes sharing the
/// database file.
pub struct SqliteDecisionStore {
    pool: SqlitePool,
    claim_wait: Duration,
}

enum ClaimState {
    Decided(String),
    Pending,
    Missing,
}

impl SqliteDecisionStore {
    pub async fn new(pool: SqlitePool, claim_wait: Duration) -> anyhow::Result<Self> {
        crate::storage::ensure_schema_version(&pool, DECISION_SCHEMA_KEY, DECISION_SCHEMA_VERSION)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS decisions (
                 prompt_id     TEXT PRIMARY KEY,
                 status        TEXT NOT NULL,
                 claim_token   TEXT NOT NULL,
                 decision_json TEXT,
                 claimed_at_ms INTEGER NOT NULL,
                 decided_at    TEXT
             )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool, claim_wait })
    }

    /// Record the first computed decision for `prompt_id` and hand that same
    /// decision to every caller.
    ///
    /// A failed computation releases the claim so a later caller may try
    /// again; nothing is recorded for it.
    pub async fn decide_once<T, F, Fut>(
        &self,
        prompt_id: &str,
        compute: F,
    ) -> Result<DecisionOutcome<T>, DecisionStoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let deadline = Instant::now() + self.claim_wait;
        let mut compute = Some(compute);

        loop {
            if let Some(compute_fn) = compute.take() {
                let token = Uuid::new_v4().to_string();
                if self.try_claim(prompt_id, &token).await? {
                    return self.compute_and_record(prompt_id, &token, compute_fn).await;
                }
                compute = Some(compute_fn);
            }

            match self.claim_state(prompt_id).await? {
                ClaimState::Decided(raw) => {
                    return Ok(DecisionOutcome {
                        decision: decode(prompt_id, &raw)?,
                        origin: DecisionOrigin::Recorded,
                    });
                }
                // claimant failed and released; race for the claim again
                ClaimState::Missing => continue,
                ClaimState::Pending => {}
            }

            if Instant::now() >= deadline {
                return Err(DecisionStoreError::ClaimTimeout {
                    prompt_id: prompt_id.to_string(),
                });
            }
            tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
        }
    }

    async fn compute_and_record<T, F, Fut>(
        &self,
        prompt_id: &str,
        token: &str,
        compute: F,
    ) -> Result<DecisionOutcome<T>, DecisionStoreError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let decision = match compute().await {
            Ok(decision) => decision,
            Err(source) => {
                sqlx::query("DELETE FROM decisions WHERE prompt_id = $1 AND claim_token = $2")
                    .bind(prompt_id)
                    .bind(token)
                    .execute(&self.pool)
                    .await?;
                return Err(DecisionStoreError::Compute {
                    prompt_id: prompt_id.to_string(),
                    source,
                });
            }
        };

        let encoded =
            serde_json::to_string(&decision).map_err(|e| DecisionStoreError::Corrupt {
                prompt_id: prompt_id.to_string(),
                reason: format!("encode decision: {e}"),
            })?;
        let updated = sqlx::query(
            "UPDATE decisions
             SET status = 'decided', decision_json = $1, decided_at = $2
             WHERE prompt_id = $3 AND claim_token = $4 AND status = 'pending'",
        )
        .bind(&encoded)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(prompt_id)
        .bind(token)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            tracing::debug!(prompt_id, "decision.recorded");
            return Ok(DecisionOutcome {
                decision,
                origin: DecisionOrigin::Computed,
            });
        }

        // The claim was released underneath us; whatever is recorded now wins.
        match self.claim_state(prompt_id).await? {
            ClaimState::Decided(raw) => Ok(DecisionOutcome {
                decision: decode(prompt_id, &raw)?,
                origin: DecisionOrigin::Recorded,
            }),
            ClaimState::Pending | ClaimState::Missing => Err(DecisionStoreError::Corrupt {
                prompt_id: prompt_id.to_string(),
                reason: "claim lost before the decision was recorded".into(),
            }),
        }
    }

    async fn try_claim(&self, prompt_id: &str, token: &str) -> Result<bool, DecisionStoreError> {
        let result = sqlx::query(
            "INSERT INTO decisions (prompt_id, status, claim_token, claimed_at_ms)
             VALUES ($1, 'pending', $2, $3)
             ON CONFLICT(prompt_id) DO NOTHING",
        )
        .bind(prompt_id)
        .bind(token)
        .bind(crate::storage::now_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_state(&self, prompt_id: &str) -> Result<ClaimState, DecisionStoreError> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, decision_json FROM decisions WHERE prompt_id = $1")
                .bind(prompt_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Ok(ClaimState::Missing),
            Some((status, _)) if status == "pending" => Ok(ClaimState::Pending),
            Some((status, Some(raw))) if status == "decided" => Ok(ClaimState::Decided(raw)),
            Some((status, _)) => Err(DecisionStoreError::Corrupt {
                prompt_id: prompt_id.to_string(),
                reason: format!("unexpected record status '{status}'"),
            }),
        }
    }

    /// The recorded decision, if any.
    pub async fn get<T: DeserializeOwned>(
        &self,
        prompt_id: &str,
    ) -> Result<Option<T>, DecisionStoreError> {
        match self.claim_state(prompt_id).await? {
            ClaimState::Decided(raw) => decode(prompt_id, &raw).map(Some),
            ClaimState::Pending | ClaimState::Missing => Ok(None),
        }
    }

    /// Drop claims left pending by a process that died mid-computation.
    pub async fn release_abandoned_claims(&self) -> Result<u64, DecisionStoreError> {
        let result = sqlx::query("DELETE FROM decisions WHERE status = 'pending'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<u64, DecisionStoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM decisions WHERE status = 'decided'")
                .fetch_one(&self.pool)
                .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn decode<T: DeserializeOwned>(prompt_id: &str, raw: &str) -> Result<T, DecisionStoreError> {
    serde_json::from_str(raw).map_err(|e| DecisionStoreError::Corrupt {
        prompt_id: prompt_id.to_string(),
        reason: e.to_string(),
    })
}
