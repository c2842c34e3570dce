use crate::decision_store::SqliteDecisionStore;
use crate::error::{LifecycleError, TrustLogError};
use crate::prompt::{LifecycleActor, LifecycleLedger, LifecycleState};
use crate::storage::now_millis;
use crate::trust_log::{ChainReport, TrustLogKind, TrustPayload};
use std::time::Duration;

/// Expire every prompt that waited longer than `reply_timeout` for a reply.
/// Returns how many were expired.
pub async fn expire_overdue(
    ledger: &LifecycleLedger,
    reply_timeout: Duration,
) -> Result<usize, LifecycleError> {
    let overdue = ledger.store().overdue(now_millis(), reply_timeout).await?;
    let mut expired = 0;
    for prompt_id in overdue {
        if ledger
            .finish(
                &prompt_id,
                LifecycleState::Expired,
                LifecycleActor::Sweeper,
                "reply timeout",
            )
            .await
            .is_some()
        {
            tracing::info!(prompt_id = %prompt_id, "prompt.expired");
            expired += 1;
        }
    }
    Ok(expired)
}

#[derive(Debug, Clone)]
pub struct RestartReport {
    pub expired: usize,
    pub released_claims: u64,
    pub integrity: Vec<(TrustLogKind, ChainReport)>,
}

impl RestartReport {
    pub fn is_healthy(&self) -> bool {
        self.integrity.iter().all(|(_, report)| report.valid)
    }

    /// First broken chain, formatted for a stop reason.
    pub fn failure(&self) -> Option<String> {
        self.integrity
            .iter()
            .find(|(_, report)| !report.valid)
            .map(|(kind, report)| format!("{kind} log: {}", report.message))
    }
}

/// Startup housekeeping: nothing from a previous run is resumed.
///
/// Non-terminal prompts are expired, half-made decision claims released and
/// both chains verified. The caller decides what an unhealthy report means.
pub async fn restart_sweep(
    ledger: &LifecycleLedger,
    decisions: &SqliteDecisionStore,
) -> anyhow::Result<RestartReport> {
    let mut expired = 0;
    for prompt_id in ledger.store().non_terminal(None).await? {
        if ledger
            .finish(
                &prompt_id,
                LifecycleState::Expired,
                LifecycleActor::Sweeper,
                "restart",
            )
            .await
            .is_some()
        {
            expired += 1;
        }
    }
    let released_claims = decisions.release_abandoned_claims().await?;
    let integrity = verify_and_record(ledger).await?;

    tracing::info!(expired, released_claims, "startup.sweep");
    Ok(RestartReport {
        expired,
        released_claims,
        integrity,
    })
}

async fn verify_and_record(
    ledger: &LifecycleLedger,
) -> Result<Vec<(TrustLogKind, ChainReport)>, TrustLogError> {
    let reports = ledger.logs().verify_all().await?;
    for (kind, report) in &reports {
        ledger
            .logs()
            .record(TrustPayload::Integrity {
                log: kind.to_string(),
                valid: report.valid,
                first_invalid_step: report.first_invalid_step,
                message: report.message.clone(),
            })
            .await?;
    }
    Ok(reports)
}
