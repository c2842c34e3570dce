//! Hash-chained, append-only records of decisions and audit events.
//!
//! Two physically separate logs share one chaining rule: the governance log
//! holds decisions and operator commands, the audit log everything else.

mod entry;
mod payload;
mod store;

pub use entry::{
    ChainReport, GENESIS_HASH, TrustLogEntry, chain_digest, content_digest, verify_chain,
};
pub use payload::{TrustPayload, TrustRecord};
pub use store::TrustLog;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::TrustLogError;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TrustLogKind {
    Governance,
    Audit,
}

impl TrustLogKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Governance => "governance.db",
            Self::Audit => "audit.db",
        }
    }
}

/// Both logs, with payloads routed to the one they belong to.
#[derive(Clone)]
pub struct TrustLogs {
    governance: Arc<TrustLog>,
    audit: Arc<TrustLog>,
}

impl TrustLogs {
    pub async fn open(state_dir: &Path) -> anyhow::Result<Self> {
        let governance = TrustLog::open(
            &state_dir.join(TrustLogKind::Governance.file_name()),
            TrustLogKind::Governance,
        )
        .await?;
        let audit = TrustLog::open(
            &state_dir.join(TrustLogKind::Audit.file_name()),
            TrustLogKind::Audit,
        )
        .await?;
        Ok(Self {
            governance: Arc::new(governance),
            audit: Arc::new(audit),
        })
    }

    pub async fn in_memory() -> anyhow::Result<Self> {
        Ok(Self {
            governance: Arc::new(TrustLog::in_memory(TrustLogKind::Governance).await?),
            audit: Arc::new(TrustLog::in_memory(TrustLogKind::Audit).await?),
        })
    }

    pub fn log(&self, kind: TrustLogKind) -> &TrustLog {
        match kind {
            TrustLogKind::Governance => &self.governance,
            TrustLogKind::Audit => &self.audit,
        }
    }

    pub fn governance(&self) -> &TrustLog {
        &self.governance
    }

    pub fn audit(&self) -> &TrustLog {
        &self.audit
    }

    pub async fn record(&self, payload: TrustPayload) -> Result<TrustLogEntry, TrustLogError> {
        self.log(payload.log_kind()).append(payload).await
    }

    /// Verify both chains, governance first.
    pub async fn verify_all(&self) -> Result<Vec<(TrustLogKind, ChainReport)>, TrustLogError> {
        let mut reports = Vec::with_capacity(2);
        for kind in [TrustLogKind::Governance, TrustLogKind::Audit] {
            reports.push((kind, self.log(kind).verify().await?));
        }
        Ok(reports)
    }
}
