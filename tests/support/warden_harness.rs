#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use promptwarden::Config;
use promptwarden::autopilot::{
    Autopilot, AutonomyMode, AutopilotState, SessionRuntime, SessionSummary, WardenServices,
};
use promptwarden::decision_store::SqliteDecisionStore;
use promptwarden::notify::{InboundReply, NotificationChannel, QueueChannel};
use promptwarden::observability::{NoopObserver, Observer};
use promptwarden::policy::{
    PatternEngine, PolicyEvaluator, RuleSet, RuleSetHandle, SessionContext,
};
use promptwarden::process::{ProcessSupervisor, ScriptedSupervisor};
use promptwarden::prompt::{LifecycleLedger, LifecycleState, SqliteLifecycleStore};
use promptwarden::storage::open_memory_pool;
use promptwarden::trust_log::{TrustLogs, TrustRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SESSION: &str = "session-under-test";
pub const WAIT: Duration = Duration::from_secs(5);

/// Timings short enough for tests, with silence detection effectively off.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.detector.silence_threshold_ms = 60_000;
    config.detector.blocked_read_min_idle_ms = 50;
    config.detector.tie_break_window_ms = 150;
    config.detector.probe_interval_ms = 20;
    config.pipeline.initial_backoff_ms = 10;
    config.pipeline.max_backoff_ms = 40;
    config.pipeline.verify_timeout_ms = 200;
    config.pipeline.verify_poll_ms = 10;
    config.storage.claim_wait_ms = 1_000;
    config.policy.match_timeout_ms = 100;
    config
}

pub struct Harness {
    pub services: WardenServices,
    pub channel: Arc<QueueChannel>,
    pub logs: TrustLogs,
}

impl Harness {
    pub async fn new(rules: &str, mode: AutonomyMode) -> Self {
        Self::build(fast_config(), rules, mode, None).await
    }

    pub async fn with_engine(
        rules: &str,
        mode: AutonomyMode,
        engine: Arc<dyn PatternEngine>,
    ) -> Self {
        Self::build(fast_config(), rules, mode, Some(engine)).await
    }

    pub async fn build(
        config: Config,
        rules: &str,
        mode: AutonomyMode,
        engine: Option<Arc<dyn PatternEngine>>,
    ) -> Self {
        let config = Arc::new(config);
        let observer: Arc<dyn Observer> = Arc::new(NoopObserver);
        let logs = TrustLogs::in_memory().await.unwrap();
        let store = SqliteLifecycleStore::new(open_memory_pool().await.unwrap())
            .await
            .unwrap();
        let decisions =
            SqliteDecisionStore::new(open_memory_pool().await.unwrap(), config.storage.claim_wait())
                .await
                .unwrap();
        let ledger = LifecycleLedger::new(store, logs.clone(), observer.clone());
        let ruleset = RuleSet::from_toml(rules, config.policy.max_pattern_size).unwrap();
        let evaluator = match engine {
            Some(engine) => PolicyEvaluator::with_engine(engine, config.policy.match_timeout()),
            None => PolicyEvaluator::new(config.policy.match_timeout()),
        };
        let channel = Arc::new(QueueChannel::new());
        let notifier: Arc<dyn NotificationChannel> = channel.clone();
        let autopilot = Autopilot::new(
            Arc::new(AutopilotState::new(mode)),
            logs.clone(),
            observer.clone(),
        )
        .with_alerts(notifier.clone());

        let services = WardenServices {
            config,
            autopilot: Arc::new(autopilot),
            ledger,
            decisions: Arc::new(decisions),
            rules: RuleSetHandle::fixed(ruleset),
            evaluator: Arc::new(evaluator),
            notifier,
            observer,
            active_sessions: Arc::new(AtomicU64::new(0)),
        };
        Self {
            services,
            channel,
            logs,
        }
    }

    pub fn store(&self) -> &SqliteLifecycleStore {
        self.services.ledger.store()
    }

    pub fn autopilot(&self) -> &Autopilot {
        &self.services.autopilot
    }

    /// Run a session over `process` in the background. Replies pushed into
    /// [`Harness::channel`] reach it.
    pub fn start_session(&self, process: Arc<ScriptedSupervisor>) -> RunningSession {
        let supervisor: Arc<dyn ProcessSupervisor> = process.clone();
        let runtime = SessionRuntime::new(
            self.services.clone(),
            SessionContext::new(SESSION),
            supervisor,
        );
        let cancel = runtime.cancel_token();
        let (reply_tx, reply_rx) = mpsc::channel::<InboundReply>(16);
        let channel = Arc::clone(&self.channel);
        let listen_cancel = cancel.clone();
        let listener = tokio::spawn(async move {
            let _ = channel.listen(reply_tx, listen_cancel).await;
        });
        let handle = tokio::spawn(runtime.run(reply_rx, None));
        RunningSession {
            process,
            cancel,
            handle,
            listener,
        }
    }

    /// Poll until `prompt_id` reaches `state` or the wait runs out.
    pub async fn wait_for_state(&self, prompt_id: &str, state: LifecycleState) -> LifecycleState {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let current = self.store().state(prompt_id).await.unwrap();
            if current == Some(state) || tokio::time::Instant::now() >= deadline {
                return current.unwrap_or_else(|| panic!("prompt {prompt_id} not found"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// The first prompt of the session under test, once it exists.
    pub async fn wait_for_prompt(&self) -> String {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let open = self.store().list(Some(SESSION), 1).await.unwrap();
            if let Some(record) = open.first() {
                return record.event.id.to_string();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no prompt was detected"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Decoded records of one trust log, oldest first.
    pub async fn records(&self, governance: bool) -> Vec<serde_json::Value> {
        let log = if governance {
            self.logs.governance()
        } else {
            self.logs.audit()
        };
        log.entries()
            .await
            .unwrap()
            .iter()
            .map(|entry| {
                let record: TrustRecord = serde_json::from_str(&entry.content).unwrap();
                serde_json::to_value(record).unwrap()
            })
            .collect()
    }

    pub async fn records_of_kind(&self, governance: bool, kind: &str) -> Vec<serde_json::Value> {
        self.records(governance)
            .await
            .into_iter()
            .filter(|record| record["kind"] == kind)
            .collect()
    }
}

pub struct RunningSession {
    pub process: Arc<ScriptedSupervisor>,
    cancel: tokio_util::sync::CancellationToken,
    handle: JoinHandle<anyhow::Result<SessionSummary>>,
    listener: JoinHandle<()>,
}

impl RunningSession {
    /// Close the process output and wait for the session to wind down.
    pub async fn finish(self) -> SessionSummary {
        self.process.close();
        self.stop_with(false).await
    }

    /// Cancel the session from outside, as Ctrl-C does.
    pub async fn cancel(self) -> SessionSummary {
        self.stop_with(true).await
    }

    async fn stop_with(self, cancel: bool) -> SessionSummary {
        if cancel {
            self.cancel.cancel();
        }
        let summary = tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("session did not stop")
            .unwrap()
            .unwrap();
        self.cancel.cancel();
        let _ = self.listener.await;
        summary
    }
}

pub const ALLOW_YES_NO: &str = r#"
[[rule]]
id = "destructive"
any_of = ["(?i)\\b(rm -rf|drop table|force push)\\b"]
action = "require_human"

[[rule]]
id = "routine-yes-no"
prompt_types = ["yes_no"]
min_confidence = "high"
action = "allow"
"#;
