use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::autopilot::{WardenServices, expire_overdue};
use crate::trust_log::TrustPayload;

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;
const MAX_RESTARTS: u32 = 10;

pub(super) fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    max_restarts: u32,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);
        let mut consecutive_failures: u32 = 0;

        loop {
            tracing::info!("Background worker '{name}' starting");
            match run_component().await {
                Ok(()) => {
                    tracing::warn!("Background worker '{name}' exited unexpectedly");
                    backoff = initial_backoff_secs.max(1);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                }
                Err(e) => {
                    tracing::error!("Background worker '{name}' failed: {e}");
                    consecutive_failures = consecutive_failures.saturating_add(1);
                }
            }

            if max_restarts > 0 && consecutive_failures > max_restarts {
                tracing::error!(
                    "Background worker '{name}' exceeded max restarts ({max_restarts}), circuit open"
                );
                break;
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

pub(super) fn spawn_background_workers(services: &WardenServices) -> Vec<JoinHandle<()>> {
    let shared = Arc::new(services.clone());
    let mut handles = Vec::new();

    let sweeper = Arc::clone(&shared);
    handles.push(spawn_component_supervisor(
        "expiry-sweeper",
        INITIAL_BACKOFF_SECS,
        MAX_BACKOFF_SECS,
        MAX_RESTARTS,
        move || {
            let services = Arc::clone(&sweeper);
            async move { run_expiry_sweeper(&services).await }
        },
    ));

    let watchdog = Arc::clone(&shared);
    handles.push(spawn_component_supervisor(
        "integrity-watchdog",
        INITIAL_BACKOFF_SECS,
        MAX_BACKOFF_SECS,
        MAX_RESTARTS,
        move || {
            let services = Arc::clone(&watchdog);
            async move { run_integrity_watchdog(&services).await }
        },
    ));

    let reloader = shared;
    handles.push(spawn_component_supervisor(
        "rules-reloader",
        INITIAL_BACKOFF_SECS,
        MAX_BACKOFF_SECS,
        MAX_RESTARTS,
        move || {
            let services = Arc::clone(&reloader);
            async move { run_rules_reloader(&services).await }
        },
    ));

    handles
}

async fn run_expiry_sweeper(services: &WardenServices) -> Result<()> {
    let lifecycle = &services.config.lifecycle;
    let mut tick = tokio::time::interval(lifecycle.sweep_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let expired = expire_overdue(&services.ledger, lifecycle.reply_timeout()).await?;
        if expired > 0 {
            tracing::info!(expired, "sweep.expired");
        }
    }
}

async fn run_integrity_watchdog(services: &WardenServices) -> Result<()> {
    let mut tick = tokio::time::interval(services.config.autopilot.integrity_check_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the startup sweep already verified both chains
    tick.tick().await;
    loop {
        tick.tick().await;
        services.autopilot.check_integrity().await?;
    }
}

async fn run_rules_reloader(services: &WardenServices) -> Result<()> {
    let mut tick = tokio::time::interval(services.config.policy.reload_interval());
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await;
    loop {
        tick.tick().await;
        let Some(result) = services.rules.reload_if_changed() else {
            continue;
        };
        let current = services.rules.current();
        let payload = match result {
            Ok(outcome) if !outcome.changed => continue,
            Ok(outcome) => TrustPayload::RulesReloaded {
                source: services.rules.source_description(),
                rule_count: outcome.rule_count,
                fingerprint: outcome.fingerprint,
                error: None,
            },
            Err(error) => {
                tracing::warn!(%error, "policy.reload_failed");
                TrustPayload::RulesReloaded {
                    source: services.rules.source_description(),
                    rule_count: current.len(),
                    fingerprint: current.fingerprint().to_string(),
                    error: Some(error.to_string()),
                }
            }
        };
        services.logs().record(payload).await?;
    }
}
