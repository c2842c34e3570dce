//! Long-lived wiring: opens storage, runs the startup sweep and keeps the
//! background workers (expiry, integrity, rule reload) alive.

mod supervisor;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::task::JoinHandle;

use crate::autopilot::{Autopilot, AutopilotState, RestartReport, WardenServices, restart_sweep};
use crate::config::Config;
use crate::decision_store::SqliteDecisionStore;
use crate::notify::NotificationChannel;
use crate::observability::create_observer;
use crate::policy::{FileRuleSource, PolicyEvaluator, RuleSetHandle};
use crate::prompt::{LifecycleLedger, SqliteLifecycleStore};
use crate::storage::open_pool;
use crate::trust_log::TrustLogs;

use supervisor::spawn_background_workers;

/// A started runtime. Sessions are attached with
/// [`crate::autopilot::SessionRuntime`] over [`Warden::services`].
pub struct Warden {
    services: WardenServices,
    restart: RestartReport,
    handles: Vec<JoinHandle<()>>,
}

impl Warden {
    /// Open the stores under `storage.state_dir`, sweep what a previous run
    /// left behind and start the background workers.
    ///
    /// A broken trust-log chain does not fail startup; the autopilot comes
    /// up stopped instead.
    pub async fn start(config: Arc<Config>, notifier: Arc<dyn NotificationChannel>) -> Result<Self> {
        let services = open_services(Arc::clone(&config), notifier).await?;
        let restart = restart_sweep(&services.ledger, &services.decisions)
            .await
            .context("startup sweep failed")?;

        if let Some(failure) = restart.failure() {
            tracing::error!(%failure, "startup.integrity_failed");
            services
                .autopilot
                .halt_for_integrity(format!("startup verification: {failure}"))
                .await?;
        }

        let handles = spawn_background_workers(&services);
        tracing::info!(
            state_dir = %config.storage.state_dir().display(),
            autopilot = %services.autopilot.snapshot().label(),
            rules = services.rules.current().len(),
            "warden.started"
        );
        Ok(Self {
            services,
            restart,
            handles,
        })
    }

    pub fn services(&self) -> &WardenServices {
        &self.services
    }

    pub fn restart_report(&self) -> &RestartReport {
        &self.restart
    }

    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("warden.stopped");
    }
}

/// Open every store and build the shared services without sweeping or
/// spawning anything.
pub async fn open_services(
    config: Arc<Config>,
    notifier: Arc<dyn NotificationChannel>,
) -> Result<WardenServices> {
    let state_dir = config.storage.state_dir();
    let observer = create_observer(&config.observability);

    let logs = TrustLogs::open(&state_dir).await?;
    let pool = open_pool(&config.storage.decisions_db()).await?;
    let store = SqliteLifecycleStore::new(pool.clone()).await?;
    let decisions = SqliteDecisionStore::new(pool, config.storage.claim_wait()).await?;
    let ledger = LifecycleLedger::new(store, logs.clone(), Arc::clone(&observer));

    let source = FileRuleSource::new(config.policy.rules_path(), config.policy.max_pattern_size);
    let rules = RuleSetHandle::load(Arc::new(source))?;
    let evaluator = PolicyEvaluator::new(config.policy.match_timeout());

    let state = Arc::new(AutopilotState::new(config.autopilot.mode));
    let autopilot = Autopilot::new(state, logs, Arc::clone(&observer))
        .with_alerts(Arc::clone(&notifier));

    Ok(WardenServices {
        config,
        autopilot: Arc::new(autopilot),
        ledger,
        decisions: Arc::new(decisions),
        rules,
        evaluator: Arc::new(evaluator),
        notifier,
        observer,
        active_sessions: Arc::new(AtomicU64::new(0)),
    })
}
