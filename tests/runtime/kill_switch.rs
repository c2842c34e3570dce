use std::sync::Arc;

use promptwarden::autopilot::{AutonomyMode, AutopilotLifecycle, OperatorCommand};
use promptwarden::process::ScriptedSupervisor;
use promptwarden::prompt::LifecycleState;

use super::warden_harness::{ALLOW_YES_NO, Harness, WAIT};

#[tokio::test]
async fn stopped_autopilot_routes_everything_to_a_human() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    h.autopilot().kill_switch().await.unwrap();

    let process = Arc::new(ScriptedSupervisor::new());
    process.advance_on_write(true);
    let session = h.start_session(Arc::clone(&process));

    process.emit("Create the output directory? [y/n] ");
    let sent = h.channel.wait_for_sent(1, WAIT).await.unwrap();
    let id = sent[0].id.to_string();
    h.wait_for_state(&id, LifecycleState::AwaitingReply).await;
    assert!(process.writes().is_empty());

    // the kill switch only suspends autonomy; the human answer is injected
    h.channel.reply(sent[0].short_id(), "y");
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Resolved).await,
        LifecycleState::Resolved
    );
    assert_eq!(process.writes(), vec!["y\n".to_string()]);
    session.finish().await;

    let decisions = h.records_of_kind(true, "decision").await;
    assert_eq!(decisions[0]["route"], "human");
    let injections = h.records_of_kind(false, "injection").await;
    assert_eq!(injections[0]["outcome"], "verified");
    assert_eq!(h.autopilot().snapshot().lifecycle, AutopilotLifecycle::Stopped);
}

#[tokio::test]
async fn kill_switch_between_retries_stops_further_writes() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    // the agent never reacts, so every attempt needs a retry
    let process = Arc::new(ScriptedSupervisor::new());
    process.set_blocked(true);
    let state = Arc::clone(h.autopilot().state());
    process.on_write(move |count| {
        if count == 1 {
            state.apply(OperatorCommand::KillSwitch).unwrap();
        }
    });
    let session = h.start_session(Arc::clone(&process));

    process.emit("Create the output directory? [y/n] ");
    let id = h.wait_for_prompt().await;
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Failed).await,
        LifecycleState::Failed
    );
    assert_eq!(process.writes().len(), 1);
    assert_eq!(h.autopilot().snapshot().lifecycle, AutopilotLifecycle::Stopped);
    assert!(h.channel.alerts().iter().any(|a| a.contains(&id)));
    session.finish().await;
}

#[tokio::test]
async fn operator_commands_land_in_the_governance_log() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Assist).await;
    h.autopilot().set_mode(AutonomyMode::Full).await.unwrap();
    h.autopilot().pause().await.unwrap();
    h.autopilot().kill_switch().await.unwrap();
    let repeat = h.autopilot().kill_switch().await.unwrap();
    assert!(!repeat.changed);
    assert!(h.autopilot().resume().await.is_err());
    h.autopilot().restart().await.unwrap();

    let commands: Vec<_> = h
        .records_of_kind(true, "operator")
        .await
        .iter()
        .map(|r| r["command"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        commands,
        vec![
            "set_mode:full",
            "pause",
            "kill_switch",
            "kill_switch",
            "restart"
        ]
    );
    assert_eq!(h.autopilot().snapshot().lifecycle, AutopilotLifecycle::Running);
}

#[tokio::test]
async fn paused_autopilot_holds_autonomous_replies() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    h.autopilot().pause().await.unwrap();
    let process = Arc::new(ScriptedSupervisor::new());
    process.advance_on_write(true);
    let session = h.start_session(Arc::clone(&process));

    process.emit("Create the output directory? [y/n] ");
    let sent = h.channel.wait_for_sent(1, WAIT).await.unwrap();
    assert!(process.writes().is_empty());

    // a human may still answer while paused
    h.channel.reply(sent[0].short_id(), "y");
    let id = sent[0].id.to_string();
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Resolved).await,
        LifecycleState::Resolved
    );
    session.finish().await;
}
