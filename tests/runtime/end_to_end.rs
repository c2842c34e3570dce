use std::sync::Arc;
use std::time::Duration;

use promptwarden::autopilot::{AutonomyMode, expire_overdue};
use promptwarden::process::ScriptedSupervisor;
use promptwarden::prompt::LifecycleState;

use super::warden_harness::{ALLOW_YES_NO, Harness, SESSION, WAIT};

fn agent() -> Arc<ScriptedSupervisor> {
    let process = Arc::new(ScriptedSupervisor::new());
    process.advance_on_write(true);
    process
}

#[tokio::test]
async fn full_mode_answers_a_routine_confirmation() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Install 3 dependencies? [y/n] ");
    let id = h.wait_for_prompt().await;
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Resolved).await,
        LifecycleState::Resolved
    );
    assert_eq!(process.writes(), vec!["y\n".to_string()]);
    assert!(h.channel.sent().is_empty());

    let summary = session.finish().await;
    assert_eq!(summary.prompts, 1);
    assert_eq!(summary.canceled, 0);

    let decisions = h.records_of_kind(true, "decision").await;
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0]["rule_id"], "routine-yes-no");
    assert_eq!(decisions[0]["action"], "allow");
    assert_eq!(decisions[0]["route"], "autonomous");
    assert_eq!(decisions[0]["mode"], "full");

    let injections = h.records_of_kind(false, "injection").await;
    assert_eq!(injections.len(), 1);
    assert_eq!(injections[0]["outcome"], "verified");
}

#[tokio::test]
async fn identical_prompt_after_an_answer_is_detected_again() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Apply changes? [y/n] ");
    let first = h.wait_for_prompt().await;
    h.wait_for_state(&first, LifecycleState::Resolved).await;

    process.emit("\napplied 3 files\nApply changes? [y/n] ");
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let counts = h.store().counts_by_state(Some(SESSION)).await.unwrap();
        if counts.get("resolved") == Some(&2) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "second prompt was not answered: {counts:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(process.writes(), vec!["y\n".to_string(), "y\n".to_string()]);

    let summary = session.finish().await;
    assert_eq!(summary.prompts, 2);
    assert_eq!(h.records_of_kind(true, "decision").await.len(), 2);
}

#[tokio::test]
async fn destructive_prompt_waits_for_a_human() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Assist).await;
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Run rm -rf build/ before packaging? [y/n] ");
    let sent = h.channel.wait_for_sent(1, WAIT).await.unwrap();
    let event = &sent[0];
    let id = event.id.to_string();
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::AwaitingReply).await,
        LifecycleState::AwaitingReply
    );
    assert!(process.writes().is_empty());

    h.channel.reply(event.short_id(), "yes");
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Resolved).await,
        LifecycleState::Resolved
    );
    assert_eq!(process.writes(), vec!["y\n".to_string()]);
    session.finish().await;

    let decisions = h.records_of_kind(true, "decision").await;
    assert_eq!(decisions[0]["rule_id"], "destructive");
    assert_eq!(decisions[0]["action"], "require_human");
    assert_eq!(decisions[0]["route"], "human");
}

#[tokio::test]
async fn undeliverable_alert_does_not_stall_later_replies() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Assist).await;
    h.channel.set_alerts_failing(true);
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Run rm -rf build/ before packaging? [y/n] ");
    let sent = h.channel.wait_for_sent(1, WAIT).await.unwrap();
    let id = sent[0].id.to_string();
    h.wait_for_state(&id, LifecycleState::AwaitingReply).await;

    // matches no prompt; the alert about it cannot be delivered
    h.channel.reply("zzzzzzzz", "y");
    h.channel.reply(sent[0].short_id(), "y");
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Resolved).await,
        LifecycleState::Resolved
    );
    assert_eq!(process.writes(), vec!["y\n".to_string()]);
    assert!(h.channel.alerts().is_empty());
    session.finish().await;
}

#[tokio::test]
async fn unmatched_prompt_escalates_by_default() {
    let h = Harness::new("", AutonomyMode::Full).await;
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Overwrite config.json? [y/n] ");
    let sent = h.channel.wait_for_sent(1, WAIT).await.unwrap();
    assert!(process.writes().is_empty());
    session.finish().await;

    let decisions = h.records_of_kind(true, "decision").await;
    assert_eq!(decisions[0]["rule_id"], "default");
    assert_eq!(decisions[0]["action"], "escalate");
    let anomalies = h.records_of_kind(false, "anomaly").await;
    assert!(
        anomalies
            .iter()
            .any(|a| a["prompt_id"] == sent[0].id.to_string())
    );
}

#[tokio::test]
async fn cancel_reply_closes_the_prompt_without_injecting() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Assist).await;
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Force push to origin/main? [y/n] ");
    let sent = h.channel.wait_for_sent(1, WAIT).await.unwrap();
    let id = sent[0].id.to_string();
    h.wait_for_state(&id, LifecycleState::AwaitingReply).await;

    h.channel.reply(sent[0].short_id(), "cancel");
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Canceled).await,
        LifecycleState::Canceled
    );
    assert!(process.writes().is_empty());
    session.finish().await;
}

#[tokio::test]
async fn stopping_the_session_cancels_open_prompts() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Assist).await;
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Drop table users? [y/n] ");
    let sent = h.channel.wait_for_sent(1, WAIT).await.unwrap();
    let id = sent[0].id.to_string();
    h.wait_for_state(&id, LifecycleState::AwaitingReply).await;

    let summary = session.cancel().await;
    assert_eq!(summary.canceled, 1);
    assert_eq!(
        h.store().state(&id).await.unwrap(),
        Some(LifecycleState::Canceled)
    );
    assert!(process.is_terminated());

    let sessions = h.records_of_kind(false, "session").await;
    let events: Vec<_> = sessions.iter().map(|s| s["event"].clone()).collect();
    assert_eq!(events, vec!["start", "stop"]);
}

#[tokio::test]
async fn reply_after_expiry_is_recorded_as_late() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Assist).await;
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Drop table sessions? [y/n] ");
    let sent = h.channel.wait_for_sent(1, WAIT).await.unwrap();
    let id = sent[0].id.to_string();
    h.wait_for_state(&id, LifecycleState::AwaitingReply).await;

    let expired = expire_overdue(&h.services.ledger, Duration::ZERO).await.unwrap();
    assert_eq!(expired, 1);

    h.channel.reply(sent[0].short_id(), "y");
    let deadline = tokio::time::Instant::now() + WAIT;
    while h.records_of_kind(false, "late_reply").await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "late reply not recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(process.writes().is_empty());
    assert_eq!(
        h.store().state(&id).await.unwrap(),
        Some(LifecycleState::Expired)
    );
    session.finish().await;
}

#[tokio::test]
async fn failed_delivery_is_audited_and_the_prompt_keeps_waiting() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Assist).await;
    h.channel.set_failing(true);
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Drop table audit? [y/n] ");
    let id = h.wait_for_prompt().await;
    let deadline = tokio::time::Instant::now() + WAIT;
    while h.records_of_kind(false, "delivery").await.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "delivery failure not recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        h.store().state(&id).await.unwrap(),
        Some(LifecycleState::AwaitingReply)
    );
    session.finish().await;
}

#[tokio::test]
async fn weak_signal_is_refined_before_the_decision() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    let process = agent();
    process.set_blocked(true);
    let session = h.start_session(Arc::clone(&process));

    // blocked-read fires first on a line with no recognizable prompt
    process.emit("Thinking about the next step");
    let id = h.wait_for_prompt().await;
    process.emit("\nApply the change? [y/n] ");

    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Resolved).await,
        LifecycleState::Resolved
    );
    let event = h.store().event(&id).await.unwrap().unwrap();
    assert_eq!(event.prompt_type.to_string(), "yes_no");
    assert_eq!(event.confidence.tier.to_string(), "high");
    assert_eq!(process.writes(), vec!["y\n".to_string()]);
    session.finish().await;
}

#[tokio::test]
async fn storage_failure_after_the_decision_fails_the_prompt() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    sqlx::query(
        "CREATE TRIGGER reject_decision_action
         BEFORE UPDATE OF decision_action ON prompt_lifecycles
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
    )
    .execute(h.store().pool())
    .await
    .unwrap();
    let process = agent();
    let session = h.start_session(Arc::clone(&process));

    process.emit("Install 3 dependencies? [y/n] ");
    let id = h.wait_for_prompt().await;
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Failed).await,
        LifecycleState::Failed
    );
    assert!(process.writes().is_empty());
    assert!(h.channel.alerts().iter().any(|a| a.contains(&id)));
    session.finish().await;

    assert_eq!(h.records_of_kind(true, "decision").await.len(), 1);
    let alerts = h.records_of_kind(false, "alert").await;
    assert!(alerts.iter().any(|a| a["prompt_id"] == id.as_str()));
    let record = h.store().record(&id).await.unwrap().unwrap();
    assert!(
        record
            .last_reason
            .unwrap_or_default()
            .contains("routing failed")
    );
}
