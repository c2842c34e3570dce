use std::sync::Arc;
use std::time::{Duration, Instant};

use promptwarden::autopilot::AutonomyMode;
use promptwarden::policy::{CompiledPattern, PatternEngine};
use promptwarden::process::ScriptedSupervisor;
use promptwarden::prompt::LifecycleState;

use super::warden_harness::{Harness, WAIT};

/// Hangs on any pattern mentioning `stall`, like a catastrophically
/// backtracking engine would.
struct StallingEngine;

impl PatternEngine for StallingEngine {
    fn name(&self) -> &str {
        "stalling"
    }

    fn is_match(&self, pattern: &CompiledPattern, haystack: &str) -> bool {
        if pattern.source.contains("stall") {
            std::thread::sleep(Duration::from_secs(2));
        }
        pattern.regex.is_match(haystack)
    }
}

const RULES: &str = r#"
[[rule]]
id = "slow"
any_of = ["stall|(?i)continue"]
action = "allow"

[[rule]]
id = "fallback"
prompt_types = ["yes_no"]
action = "deny"
"#;

#[tokio::test]
async fn slow_rule_is_skipped_and_the_next_rule_decides() {
    let h = Harness::with_engine(RULES, AutonomyMode::Full, Arc::new(StallingEngine)).await;
    let process = Arc::new(ScriptedSupervisor::new());
    process.advance_on_write(true);
    let session = h.start_session(Arc::clone(&process));

    let started = Instant::now();
    process.emit("Continue with the migration? [y/n] ");
    let id = h.wait_for_prompt().await;
    assert_eq!(
        h.wait_for_state(&id, LifecycleState::Resolved).await,
        LifecycleState::Resolved
    );
    assert!(started.elapsed() < Duration::from_millis(1_800));
    assert_eq!(process.writes(), vec!["n\n".to_string()]);
    session.finish().await;

    let decisions = h.records_of_kind(true, "decision").await;
    assert_eq!(decisions[0]["rule_id"], "fallback");
    assert_eq!(decisions[0]["action"], "deny");

    let anomalies = h.records_of_kind(false, "anomaly").await;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0]["rule_id"], "slow");
    assert!(started.elapsed() < WAIT);
}
