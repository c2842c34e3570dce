use std::sync::Arc;

use chrono::Utc;
use promptwarden::Config;
use promptwarden::autopilot::{AutonomyMode, AutopilotLifecycle};
use promptwarden::daemon::{Warden, open_services};
use promptwarden::notify::{NotificationChannel, QueueChannel};
use promptwarden::prompt::{
    Confidence, ConfidenceTier, DetectionSignal, LifecycleActor, LifecycleState, PromptEvent,
    PromptType,
};
use promptwarden::storage::open_pool;
use promptwarden::trust_log::TrustLogKind;
use tempfile::TempDir;
use uuid::Uuid;

fn config_in(dir: &TempDir) -> Arc<Config> {
    let mut config = Config::default();
    config.storage.state_dir = dir.path().join("state").display().to_string();
    config.policy.rules_path = dir.path().join("rules.toml").display().to_string();
    config.autopilot.mode = AutonomyMode::Full;
    Arc::new(config)
}

fn notifier() -> Arc<dyn NotificationChannel> {
    Arc::new(QueueChannel::new())
}

fn waiting_prompt() -> PromptEvent {
    PromptEvent {
        id: Uuid::new_v4(),
        session_id: "before-crash".into(),
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
async fn restart_expires_prompts_left_in_flight() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let prompt = waiting_prompt();
    let id = prompt.id.to_string();
    {
        let services = open_services(Arc::clone(&config), notifier()).await.unwrap();
        let ledger = &services.ledger;
        ledger.store().create(&prompt).await.unwrap();
        ledger
            .advance(&id, LifecycleState::Routed, LifecycleActor::Router, None)
            .await
            .unwrap();
        ledger
            .advance(
                &id,
                LifecycleState::AwaitingReply,
                LifecycleActor::ReplyPath,
                None,
            )
            .await
            .unwrap();
    }

    let warden = Warden::start(Arc::clone(&config), notifier()).await.unwrap();
    let report = warden.restart_report().clone();
    assert_eq!(report.expired, 1);
    assert!(report.is_healthy());

    let services = warden.services();
    let record = services.ledger.store().record(&id).await.unwrap().unwrap();
    assert_eq!(record.state, LifecycleState::Expired);
    assert_eq!(record.last_reason.as_deref(), Some("restart"));
    assert_eq!(
        services.autopilot.snapshot().lifecycle,
        AutopilotLifecycle::Running
    );
    warden.shutdown().await;
}

#[tokio::test]
async fn broken_chain_starts_the_autopilot_stopped() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    {
        let services = open_services(Arc::clone(&config), notifier()).await.unwrap();
        services.autopilot.pause().await.unwrap();
        services.autopilot.resume().await.unwrap();
    }

    let governance = config
        .storage
        .state_dir()
        .join(TrustLogKind::Governance.file_name());
    let pool = open_pool(&governance).await.unwrap();
    sqlx::query("UPDATE trust_log SET content = replace(content, 'pause', 'resume') WHERE step = 1")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let alerts = Arc::new(QueueChannel::new());
    let warden = Warden::start(Arc::clone(&config), alerts.clone()).await.unwrap();
    assert!(!warden.restart_report().is_healthy());

    let snapshot = warden.services().autopilot.snapshot();
    assert_eq!(snapshot.lifecycle, AutopilotLifecycle::Stopped);
    assert!(
        snapshot
            .stop_reason
            .unwrap()
            .contains("startup verification")
    );
    assert_eq!(alerts.alerts().len(), 1);
    warden.shutdown().await;
}
