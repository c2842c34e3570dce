use std::sync::Arc;

use promptwarden::autopilot::{AutonomyMode, AutopilotLifecycle};
use promptwarden::process::ScriptedSupervisor;
use promptwarden::trust_log::TrustLogKind;

use super::warden_harness::{ALLOW_YES_NO, Harness, WAIT};

#[tokio::test]
async fn edited_decision_halts_autonomy() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    h.autopilot().pause().await.unwrap();
    h.autopilot().resume().await.unwrap();
    h.autopilot().set_mode(AutonomyMode::Assist).await.unwrap();
    h.autopilot().set_mode(AutonomyMode::Full).await.unwrap();

    let intact = h.autopilot().check_integrity().await.unwrap();
    assert!(intact.iter().all(|(_, report)| report.valid));

    // rewrite history: the resume never happened
    sqlx::query("UPDATE trust_log SET content = replace(content, 'resume', 'pause') WHERE step = 2")
        .execute(h.logs.governance().pool())
        .await
        .unwrap();

    let reports = h.autopilot().check_integrity().await.unwrap();
    let (_, governance) = reports
        .iter()
        .find(|(kind, _)| *kind == TrustLogKind::Governance)
        .unwrap();
    assert!(!governance.valid);
    assert_eq!(governance.first_invalid_step, Some(2));
    assert!(governance.invalid_steps.contains(&4));

    let snapshot = h.autopilot().snapshot();
    assert_eq!(snapshot.lifecycle, AutopilotLifecycle::Stopped);
    let integrity = h.records_of_kind(false, "integrity").await;
    assert_eq!(integrity.len(), 1);
    assert_eq!(integrity[0]["log"], "governance");
    assert_eq!(integrity[0]["first_invalid_step"], 2);

    // nothing is answered autonomously any more
    let process = Arc::new(ScriptedSupervisor::new());
    process.advance_on_write(true);
    let session = h.start_session(Arc::clone(&process));
    process.emit("Create the output directory? [y/n] ");
    h.channel.wait_for_sent(1, WAIT).await.unwrap();
    assert!(process.writes().is_empty());
    session.finish().await;
}

#[tokio::test]
async fn appended_entries_keep_the_chain_valid() {
    let h = Harness::new(ALLOW_YES_NO, AutonomyMode::Full).await;
    let process = Arc::new(ScriptedSupervisor::new());
    process.advance_on_write(true);
    let session = h.start_session(Arc::clone(&process));
    process.emit("Create the output directory? [y/n] ");
    h.wait_for_prompt().await;
    session.finish().await;

    for (kind, report) in h.logs.verify_all().await.unwrap() {
        assert!(report.valid, "{kind} chain broken: {}", report.message);
        assert!(report.total > 0);
    }
}
