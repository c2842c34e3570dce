use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::routing::{Route, route};
use super::services::WardenServices;
use crate::decision_store::DecisionOutcome;
use crate::detector::{DetectorOutput, PromptDetector, strip_ansi};
use crate::error::{ExecutionError, LifecycleError};
use crate::notify::InboundReply;
use crate::observability::{ObserverEvent, ObserverMetric};
use crate::pipeline::{
    ExecutionPlan, Executor, InjectionGate, PlannedAction, ReplyValue, RetryPolicy, classify,
    plan_for_policy, plan_for_reply,
};
use crate::policy::{PolicyDecision, SessionContext};
use crate::process::ProcessSupervisor;
use crate::prompt::{ConfidenceTier, LifecycleActor, LifecycleState, PromptEvent};
use crate::trust_log::TrustPayload;

const CHUNK_QUEUE: usize = 256;
const PLAN_QUEUE: usize = 64;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_id: String,
    pub prompts: i64,
    /// Prompts still open when the session stopped.
    pub canceled: usize,
}

/// One supervised process under the autopilot.
///
/// `run` drives four activities (output reader, input relay, detector
/// watchdog, reply consumer) until the process closes its output or the
/// cancellation token fires.
pub struct SessionRuntime {
    services: WardenServices,
    context: SessionContext,
    supervisor: Arc<dyn ProcessSupervisor>,
    cancel: CancellationToken,
    echo_output: bool,
}

impl SessionRuntime {
    pub fn new(
        services: WardenServices,
        context: SessionContext,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            services,
            context,
            supervisor,
            cancel: CancellationToken::new(),
            echo_output: false,
        }
    }

    /// Copy raw process output to our stdout.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    /// Cancelling this token stops the session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.context.session_id
    }

    pub async fn run(
        self,
        replies: mpsc::Receiver<InboundReply>,
        input: Option<mpsc::Receiver<Vec<u8>>>,
    ) -> Result<SessionSummary> {
        let detector = PromptDetector::new(
            self.context.session_id.clone(),
            &self.services.config.detector,
            Instant::now(),
        )?;
        let gate: Arc<dyn InjectionGate> = self.services.autopilot.state().clone();
        let executor = Executor::new(
            Arc::clone(&self.supervisor),
            self.services.ledger.clone(),
            gate,
            Arc::clone(&self.services.notifier),
        );
        let shared = Arc::new(Session {
            retry: RetryPolicy::from_config(&self.services.config.pipeline),
            services: self.services,
            context: self.context,
            supervisor: self.supervisor,
            executor,
            cancel: self.cancel,
            queued_plans: AtomicU64::new(0),
        });
        let session_id = shared.context.session_id.clone();

        shared.record_session_event("start", None).await;
        let active = shared.services.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        shared
            .services
            .observer
            .record_metric(&ObserverMetric::ActiveSessions(active));
        tracing::info!(session_id = %session_id, supervisor = shared.supervisor.name(), "session.start");

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_QUEUE);
        let (plan_tx, plan_rx) = mpsc::channel(PLAN_QUEUE);

        let mut activities = JoinSet::new();
        activities.spawn(Arc::clone(&shared).read_output(chunk_tx, self.echo_output));
        activities.spawn(Arc::clone(&shared).watch(detector, chunk_rx, plan_tx));
        activities.spawn(Arc::clone(&shared).consume(replies, plan_rx));
        if let Some(input) = input {
            activities.spawn(Arc::clone(&shared).relay(input));
        }
        while let Some(joined) = activities.join_next().await {
            if let Err(error) = joined {
                tracing::error!(session_id = %session_id, %error, "session activity panicked");
                shared.cancel.cancel();
            }
        }

        let canceled = shared.cancel_open_prompts().await;
        if let Err(error) = shared.supervisor.terminate().await {
            tracing::warn!(session_id = %session_id, %error, "process.terminate_failed");
        }
        let prompts = shared
            .services
            .ledger
            .store()
            .counts_by_state(Some(&session_id))
            .await?
            .values()
            .sum();
        shared
            .record_session_event("stop", Some(format!("{prompts} prompts, {canceled} canceled")))
            .await;
        let active = shared
            .services
            .active_sessions
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        shared
            .services
            .observer
            .record_metric(&ObserverMetric::ActiveSessions(active));
        tracing::info!(session_id = %session_id, prompts, canceled, "session.stop");

        Ok(SessionSummary {
            session_id,
            prompts,
            canceled,
        })
    }
}

struct Session {
    services: WardenServices,
    context: SessionContext,
    supervisor: Arc<dyn ProcessSupervisor>,
    executor: Executor,
    retry: RetryPolicy,
    cancel: CancellationToken,
    queued_plans: AtomicU64,
}

impl Session {
    // ── Activities ──────────────────────────────────────────────────────

    async fn read_output(self: Arc<Self>, chunks: mpsc::Sender<String>, echo: bool) {
        let mut stdout = tokio::io::stdout();
        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => break,
                chunk = self.supervisor.read_output() => chunk,
            };
            match chunk {
                Ok(Some(bytes)) => {
                    if echo {
                        let _ = stdout.write_all(&bytes).await;
                        let _ = stdout.flush().await;
                    }
                    let text = strip_ansi(&bytes);
                    if !text.is_empty() && chunks.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!(session_id = %self.context.session_id, "session.output_closed");
                    break;
                }
                Err(error) => {
                    tracing::warn!(session_id = %self.context.session_id, %error, "session.read_failed");
                    break;
                }
            }
        }
        self.cancel.cancel();
    }

    async fn relay(self: Arc<Self>, mut input: mpsc::Receiver<Vec<u8>>) {
        loop {
            let bytes = tokio::select! {
                () = self.cancel.cancelled() => break,
                bytes = input.recv() => bytes,
            };
            let Some(bytes) = bytes else { break };
            if let Err(error) = self.supervisor.write(&bytes).await {
                tracing::warn!(session_id = %self.context.session_id, %error, "session.relay_failed");
            }
        }
    }

    async fn watch(
        self: Arc<Self>,
        mut detector: PromptDetector,
        mut chunks: mpsc::Receiver<String>,
        plans: mpsc::Sender<ExecutionPlan>,
    ) {
        let mut probe = tokio::time::interval(self.services.config.detector.probe_interval());
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut prompts = JoinSet::new();

        loop {
            let output = tokio::select! {
                () = self.cancel.cancelled() => break,
                chunk = chunks.recv() => {
                    let Some(text) = chunk else { break };
                    detector.on_output(&text, Instant::now())
                }
                _ = probe.tick() => {
                    let blocked = self.supervisor.is_blocked_on_read().await;
                    detector.on_probe(blocked, Instant::now())
                }
            };

            if let Some(output) = output
                && let Some(event) = self.on_detection(output).await
            {
                prompts.spawn(Arc::clone(&self).handle_prompt(event, plans.clone()));
            }
            while let Some(done) = prompts.try_join_next() {
                log_prompt_task(done);
            }
        }

        while let Some(done) = prompts.join_next().await {
            log_prompt_task(done);
        }
    }

    async fn consume(
        self: Arc<Self>,
        mut replies: mpsc::Receiver<InboundReply>,
        mut plans: mpsc::Receiver<ExecutionPlan>,
    ) {
        let mut replies_open = true;
        let mut plans_open = true;
        while replies_open || plans_open {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                plan = plans.recv(), if plans_open => match plan {
                    Some(plan) => {
                        let depth = self.queued_plans.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                        self.services.observer.record_metric(&ObserverMetric::QueueDepth(depth));
                        self.run_plan(&plan).await;
                    }
                    None => plans_open = false,
                },
                reply = replies.recv(), if replies_open => match reply {
                    Some(reply) => self.on_reply(reply).await,
                    None => replies_open = false,
                },
            }
        }
    }

    // ── Detection → decision → route ────────────────────────────────────

    /// Persist what the detector saw. Returns the event when it is new and
    /// needs a decision.
    async fn on_detection(&self, output: DetectorOutput) -> Option<PromptEvent> {
        let store = self.services.ledger.store();
        let (event, refined) = match output {
            DetectorOutput::Created(event) => match store.create(&event).await {
                Ok(true) => (event, false),
                Ok(false) => return None,
                Err(error) => {
                    tracing::error!(prompt_id = %event.id, %error, "prompt.create_failed");
                    return None;
                }
            },
            DetectorOutput::Refined(event) => match store.refine(&event).await {
                Ok(true) => (event, true),
                Ok(false) => return None,
                Err(error) => {
                    tracing::warn!(prompt_id = %event.id, %error, "prompt.refine_failed");
                    return None;
                }
            },
        };

        self.services
            .observer
            .record_event(&ObserverEvent::PromptDetected {
                session_id: event.session_id.clone(),
                prompt_type: event.prompt_type.to_string(),
                tier: event.confidence.tier.to_string(),
                refined,
            });
        tracing::info!(
            prompt_id = %event.id,
            session_id = %event.session_id,
            prompt_type = %event.prompt_type,
            tier = %event.confidence.tier,
            signal = event.signal.name(),
            refined,
            "prompt.detected"
        );
        (!refined).then_some(event)
    }

    async fn handle_prompt(
        self: Arc<Self>,
        event: PromptEvent,
        plans: mpsc::Sender<ExecutionPlan>,
    ) {
        let prompt_id = event.id.to_string();

        // Weak signals wait out the tie-break window so a stronger signal
        // for the same stall can refine the event first.
        let mut event = event;
        if event.confidence.tier < ConfidenceTier::High {
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.services.config.detector.tie_break_window()) => {}
            }
            match self.services.ledger.store().event(&prompt_id).await {
                Ok(Some(latest)) => event = latest,
                Ok(None) => {}
                Err(error) => tracing::warn!(prompt_id = %prompt_id, %error, "prompt.reload_failed"),
            }
        }

        let Some(decision) = self.decide(&event).await else {
            return;
        };
        // The decision is recorded; from here on the prompt must end terminal.
        if let Err(error) = self.route_decided(&event, &decision, &plans).await {
            tracing::error!(prompt_id = %prompt_id, %error, "prompt.routing_failed");
            self.fail_prompt(&prompt_id, &format!("routing failed after decision: {error}"))
                .await;
        }
    }

    async fn route_decided(
        &self,
        event: &PromptEvent,
        decision: &PolicyDecision,
        plans: &mpsc::Sender<ExecutionPlan>,
    ) -> Result<()> {
        let prompt_id = event.id.to_string();
        let store = self.services.ledger.store();
        let snapshot = self.services.autopilot.snapshot();
        let routing = route(decision.action, &snapshot);
        let history = store
            .session_history(
                &self.context.session_id,
                self.services.config.pipeline.history_window,
            )
            .await?;
        let classification = classify(event, &history);

        let mut final_route = routing.route;
        let mut route_reason = routing.reason.to_string();
        let mut plan = None;
        if routing.route == Route::Autonomous {
            let candidate = plan_for_policy(event, &classification, decision, self.retry);
            match &candidate.action {
                PlannedAction::Inject { .. } => plan = Some(candidate),
                PlannedAction::Escalate { reason } => {
                    final_route = Route::Human;
                    route_reason = reason.clone();
                }
                PlannedAction::Cancel => final_route = Route::Human,
            }
        }

        let recorded = self
            .services
            .logs()
            .record(TrustPayload::Decision {
                prompt_id: prompt_id.clone(),
                session_id: self.context.session_id.clone(),
                rule_id: decision.rule_id.clone(),
                action: routing.effective_action.to_string(),
                explanation: format!(
                    "{}; {} ({})",
                    decision.explanation, classification.class, route_reason
                ),
                confidence_tier: decision.confidence.tier.to_string(),
                confidence_score: decision.confidence.score,
                mode: snapshot.mode.to_string(),
                route: final_route.to_string(),
            })
            .await;
        if let Err(error) = recorded {
            tracing::error!(prompt_id = %prompt_id, %error, "decision could not be recorded");
            self.fail_closed(&prompt_id, &format!("governance log write failed: {error}"))
                .await;
            return Ok(());
        }
        self.services
            .observer
            .record_event(&ObserverEvent::DecisionMade {
                rule_id: decision.rule_id.clone(),
                action: routing.effective_action.to_string(),
                route: final_route.to_string(),
            });
        store
            .set_decision_action(&prompt_id, &routing.effective_action.to_string())
            .await?;

        let ledger = &self.services.ledger;
        ledger
            .advance(
                &prompt_id,
                LifecycleState::Routed,
                LifecycleActor::Router,
                Some(&route_reason),
            )
            .await?;
        ledger
            .advance(
                &prompt_id,
                LifecycleState::AwaitingReply,
                LifecycleActor::ReplyPath,
                None,
            )
            .await?;

        match plan {
            Some(plan) => {
                ledger
                    .advance(
                        &prompt_id,
                        LifecycleState::ReplyReceived,
                        LifecycleActor::ReplyPath,
                        Some(&format!("policy rule '{}'", decision.rule_id)),
                    )
                    .await?;
                let depth = self.queued_plans.fetch_add(1, Ordering::SeqCst) + 1;
                self.services
                    .observer
                    .record_metric(&ObserverMetric::QueueDepth(depth));
                if plans.send(plan).await.is_err() {
                    self.queued_plans.fetch_sub(1, Ordering::SeqCst);
                    ledger
                        .finish(
                            &prompt_id,
                            LifecycleState::Failed,
                            LifecycleActor::ReplyPath,
                            "session stopped before injection",
                        )
                        .await;
                }
            }
            None => self.deliver(event).await,
        }
        Ok(())
    }

    /// At-most-once policy decision for one prompt. `None` means the
    /// prompt was failed and nothing more should happen to it.
    async fn decide(&self, event: &PromptEvent) -> Option<PolicyDecision> {
        let prompt_id = event.id.to_string();
        let evaluator = Arc::clone(&self.services.evaluator);
        let rules = self.services.rules.current();
        let context = self.context.clone();
        let subject = event.clone();
        let mut anomalies = Vec::new();
        let anomaly_slot = &mut anomalies;
        let started = Instant::now();

        let outcome = self
            .services
            .decisions
            .decide_once(&prompt_id, move || async move {
                let evaluation = tokio::task::spawn_blocking(move || {
                    evaluator.evaluate(&subject, &rules, &context)
                })
                .await?;
                *anomaly_slot = evaluation.anomalies;
                Ok(evaluation.decision)
            })
            .await;

        let decision = match outcome {
            Ok(outcome) if outcome.is_fresh() => outcome.decision,
            Ok(DecisionOutcome { origin, .. }) => {
                tracing::info!(prompt_id = %prompt_id, %origin, "decision already recorded");
                return None;
            }
            Err(error) => {
                tracing::error!(prompt_id = %prompt_id, %error, "decision.failed");
                if error.is_integrity_failure() {
                    self.fail_closed(&prompt_id, &format!("decision store failure: {error}"))
                        .await;
                } else {
                    self.fail_prompt(&prompt_id, &format!("no decision: {error}"))
                        .await;
                }
                return None;
            }
        };
        self.services
            .observer
            .record_metric(&ObserverMetric::EvaluationLatency(started.elapsed()));

        for anomaly in &anomalies {
            self.services.observer.record_event(&ObserverEvent::Anomaly {
                rule_id: anomaly.rule_id().to_string(),
                detail: anomaly.describe(),
            });
            let payload = TrustPayload::Anomaly {
                prompt_id: prompt_id.clone(),
                rule_id: anomaly.rule_id().to_string(),
                detail: anomaly.describe(),
            };
            if let Err(error) = self.services.logs().record(payload).await {
                tracing::error!(prompt_id = %prompt_id, %error, "audit.write_failed");
            }
        }
        Some(decision)
    }

    async fn deliver(&self, event: &PromptEvent) {
        let notifier = &self.services.notifier;
        let error = match tokio::time::timeout(DELIVERY_TIMEOUT, notifier.send(event)).await {
            Ok(Ok(receipt)) => {
                tracing::info!(prompt_id = %event.id, channel = %receipt.channel, "prompt.delivered");
                return;
            }
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("delivery timed out after {}s", DELIVERY_TIMEOUT.as_secs()),
        };
        tracing::warn!(prompt_id = %event.id, channel = notifier.name(), %error, "prompt.delivery_failed");
        let payload = TrustPayload::Delivery {
            prompt_id: event.id.to_string(),
            channel: notifier.name().to_string(),
            error,
        };
        if let Err(error) = self.services.logs().record(payload).await {
            tracing::error!(prompt_id = %event.id, %error, "audit.write_failed");
        }
    }

    // ── Replies and execution ───────────────────────────────────────────

    async fn on_reply(&self, reply: InboundReply) {
        if let Err(error) = self.apply_reply(&reply).await {
            tracing::warn!(prompt_ref = %reply.prompt_ref, %error, "reply.rejected");
        }
    }

    async fn apply_reply(&self, reply: &InboundReply) -> Result<(), LifecycleError> {
        let store = self.services.ledger.store();
        let Some(prompt_id) = store.resolve_ref(&reply.prompt_ref).await? else {
            tracing::warn!(prompt_ref = %reply.prompt_ref, "reply.unknown_prompt");
            let message = format!("no single prompt matches '{}'", reply.prompt_ref);
            if let Err(error) = self.services.notifier.alert(&message).await {
                tracing::warn!(prompt_ref = %reply.prompt_ref, %error, "alert delivery failed");
            }
            return Ok(());
        };
        let Some(record) = store.record(&prompt_id).await? else {
            return Err(LifecycleError::UnknownPrompt(prompt_id));
        };
        if record.event.session_id != self.context.session_id {
            tracing::debug!(prompt_id = %prompt_id, "reply for another session ignored");
            return Ok(());
        }
        if record.state.is_terminal() {
            self.record_late_reply(&prompt_id, record.state).await;
            return Ok(());
        }
        if record.state != LifecycleState::AwaitingReply {
            tracing::info!(prompt_id = %prompt_id, state = %record.state, "reply.ignored");
            return Ok(());
        }

        let value = ReplyValue::parse(&reply.value);
        let plan = plan_for_reply(&record.event, &value, self.retry);
        let ledger = &self.services.ledger;
        if plan.action == PlannedAction::Cancel {
            ledger
                .advance(
                    &prompt_id,
                    LifecycleState::Canceled,
                    LifecycleActor::ReplyPath,
                    Some(&format!("canceled via {}", reply.channel)),
                )
                .await?;
            return Ok(());
        }

        let received = ledger
            .advance(
                &prompt_id,
                LifecycleState::ReplyReceived,
                LifecycleActor::ReplyPath,
                Some(&format!("human reply via {}", reply.channel)),
            )
            .await;
        match received {
            Ok(_) => {}
            Err(LifecycleError::AlreadyTerminal { state, .. }) => {
                self.record_late_reply(&prompt_id, state).await;
                return Ok(());
            }
            Err(error) => return Err(error),
        }
        self.run_plan(&plan).await;
        Ok(())
    }

    async fn record_late_reply(&self, prompt_id: &str, state: LifecycleState) {
        tracing::warn!(prompt_id, %state, "reply.late");
        let payload = TrustPayload::LateReply {
            prompt_id: prompt_id.to_string(),
            state: state.to_string(),
        };
        if let Err(error) = self.services.logs().record(payload).await {
            tracing::error!(prompt_id, %error, "audit.write_failed");
        }
    }

    async fn run_plan(&self, plan: &ExecutionPlan) {
        match self.executor.execute(plan).await {
            Ok(report) => {
                tracing::info!(prompt_id = %plan.prompt_id, attempts = report.attempts, "prompt.resolved");
            }
            Err(error @ (ExecutionError::KillSwitch { .. }
            | ExecutionError::VerificationExhausted { .. }
            | ExecutionError::Write { .. })) => {
                tracing::warn!(prompt_id = %plan.prompt_id, %error, "prompt.failed");
            }
            Err(error) => {
                tracing::error!(prompt_id = %plan.prompt_id, %error, "execution.error");
            }
        }
    }

    // ── Failure paths ───────────────────────────────────────────────────

    async fn fail_prompt(&self, prompt_id: &str, reason: &str) {
        self.services
            .ledger
            .finish(
                prompt_id,
                LifecycleState::Failed,
                LifecycleActor::Router,
                reason,
            )
            .await;
        let payload = TrustPayload::Alert {
            prompt_id: Some(prompt_id.to_string()),
            message: reason.to_string(),
        };
        if let Err(error) = self.services.logs().record(payload).await {
            tracing::error!(prompt_id, %error, "audit.write_failed");
        }
        if let Err(error) = self
            .services
            .notifier
            .alert(&format!("prompt {prompt_id}: {reason}"))
            .await
        {
            tracing::warn!(prompt_id, %error, "alert delivery failed");
        }
    }

    /// Storage integrity failure: fail the prompt and stop autonomous
    /// execution everywhere.
    async fn fail_closed(&self, prompt_id: &str, reason: &str) {
        self.fail_prompt(prompt_id, reason).await;
        if let Err(error) = self.services.autopilot.halt_for_integrity(reason).await {
            tracing::error!(%error, "integrity halt could not be recorded");
        }
    }

    async fn cancel_open_prompts(&self) -> usize {
        let open = match self
            .services
            .ledger
            .store()
            .non_terminal(Some(&self.context.session_id))
            .await
        {
            Ok(open) => open,
            Err(error) => {
                tracing::error!(session_id = %self.context.session_id, %error, "session.sweep_failed");
                return 0;
            }
        };
        let mut canceled = 0;
        for prompt_id in open {
            if self
                .services
                .ledger
                .finish(
                    &prompt_id,
                    LifecycleState::Canceled,
                    LifecycleActor::Session,
                    "session stopped",
                )
                .await
                .is_some()
            {
                canceled += 1;
            }
        }
        canceled
    }

    async fn record_session_event(&self, event: &str, detail: Option<String>) {
        let payload = TrustPayload::Session {
            session_id: self.context.session_id.clone(),
            event: event.to_string(),
            detail,
        };
        if let Err(error) = self.services.logs().record(payload).await {
            tracing::error!(session_id = %self.context.session_id, %error, "audit.write_failed");
        }
    }
}

fn log_prompt_task(done: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(error) = done {
        tracing::error!(%error, "prompt task panicked");
    }
}
