use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LifecycleError;

/// Per-prompt lifecycle state.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Routed,
    AwaitingReply,
    ReplyReceived,
    Injected,
    Resolved,
    Expired,
    Canceled,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Resolved | Self::Expired | Self::Canceled | Self::Failed
        )
    }

    /// Position along the forward path; every terminal state ranks last.
    pub fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Routed => 1,
            Self::AwaitingReply => 2,
            Self::ReplyReceived => 3,
            Self::Injected => 4,
            Self::Resolved | Self::Expired | Self::Canceled | Self::Failed => 5,
        }
    }

    /// The allowed-transition table.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Self::Created, Self::Routed)
                | (Self::Routed, Self::AwaitingReply)
                | (Self::AwaitingReply, Self::ReplyReceived)
                | (Self::ReplyReceived, Self::Injected)
                | (Self::Injected, Self::Resolved)
                | (_, Self::Expired | Self::Canceled | Self::Failed)
        )
    }
}

/// Component requesting a transition. Each edge has a fixed set of owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleActor {
    Router,
    ReplyPath,
    Executor,
    Sweeper,
    Session,
}

impl LifecycleActor {
    pub fn permits(self, from: LifecycleState, to: LifecycleState) -> bool {
        use LifecycleState as S;
        match (self, to) {
            (Self::Router, S::Routed) => from == S::Created,
            (Self::ReplyPath, S::AwaitingReply) => from == S::Routed,
            (Self::ReplyPath, S::ReplyReceived) => from == S::AwaitingReply,
            (Self::Executor, S::Injected) => from == S::ReplyReceived,
            (Self::Executor, S::Resolved) => from == S::Injected,
            (Self::Sweeper, S::Expired) => true,
            (Self::ReplyPath | Self::Session, S::Canceled) => true,
            (Self::Router | Self::ReplyPath | Self::Executor, S::Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub actor: LifecycleActor,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Validate one transition against the table and the actor ownership rules.
pub fn check_transition(
    prompt_id: &str,
    from: LifecycleState,
    to: LifecycleState,
    actor: LifecycleActor,
) -> Result<(), LifecycleError> {
    if from.is_terminal() {
        return Err(LifecycleError::AlreadyTerminal {
            prompt_id: prompt_id.to_string(),
            state: from,
            attempted: to,
        });
    }
    if !from.can_transition_to(to) {
        return Err(LifecycleError::IllegalTransition {
            prompt_id: prompt_id.to_string(),
            from,
            to,
        });
    }
    if !actor.permits(from, to) {
        return Err(LifecycleError::ActorNotPermitted {
            prompt_id: prompt_id.to_string(),
            actor: actor.to_string(),
            from,
            to,
        });
    }
    Ok(())
}

/// In-memory state machine for one prompt.
#[derive(Debug, Clone)]
pub struct PromptLifecycle {
    prompt_id: String,
    state: LifecycleState,
    history: Vec<Transition>,
}

impl PromptLifecycle {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            state: LifecycleState::Created,
            history: Vec::new(),
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(
        &mut self,
        to: LifecycleState,
        actor: LifecycleActor,
        reason: Option<&str>,
    ) -> Result<Transition, LifecycleError> {
        check_transition(&self.prompt_id, self.state, to, actor)?;
        let transition = Transition {
            from: self.state,
            to,
            actor,
            reason: reason.map(str::to_string),
            at: Utc::now(),
        };
        self.history.push(transition.clone());
        self.state = to;
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_STATES: [LifecycleState; 9] = [
        LifecycleState::Created,
        LifecycleState::Routed,
        LifecycleState::AwaitingReply,
        LifecycleState::ReplyReceived,
        LifecycleState::Injected,
        LifecycleState::Resolved,
        LifecycleState::Expired,
        LifecycleState::Canceled,
        LifecycleState::Failed,
    ];

    const ALL_ACTORS: [LifecycleActor; 5] = [
        LifecycleActor::Router,
        LifecycleActor::ReplyPath,
        LifecycleActor::Executor,
        LifecycleActor::Sweeper,
        LifecycleActor::Session,
    ];

    fn drive(lifecycle: &mut PromptLifecycle, steps: &[(LifecycleState, LifecycleActor)]) {
        for (to, actor) in steps {
            lifecycle.transition(*to, *actor, None).unwrap();
        }
    }

    #[test]
    fn happy_path_reaches_resolved() {
        let mut lifecycle = PromptLifecycle::new("p-1");
        drive(
            &mut lifecycle,
            &[
                (LifecycleState::Routed, LifecycleActor::Router),
                (LifecycleState::AwaitingReply, LifecycleActor::ReplyPath),
                (LifecycleState::ReplyReceived, LifecycleActor::ReplyPath),
                (LifecycleState::Injected, LifecycleActor::Executor),
                (LifecycleState::Resolved, LifecycleActor::Executor),
            ],
        );
        assert_eq!(lifecycle.state(), LifecycleState::Resolved);
        assert_eq!(lifecycle.history().len(), 5);
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let mut lifecycle = PromptLifecycle::new("p-1");
        let err = lifecycle
            .transition(LifecycleState::Injected, LifecycleActor::Executor, None)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::IllegalTransition { .. }));
        assert_eq!(lifecycle.state(), LifecycleState::Created);
    }

    #[test]
    fn terminal_state_rejects_everything() {
        let mut lifecycle = PromptLifecycle::new("p-1");
        lifecycle
            .transition(LifecycleState::Expired, LifecycleActor::Sweeper, Some("timeout"))
            .unwrap();
        for to in ALL_STATES {
            let err = lifecycle
                .transition(to, LifecycleActor::Sweeper, None)
                .unwrap_err();
            assert!(matches!(err, LifecycleError::AlreadyTerminal { .. }));
        }
    }

    #[test]
    fn router_cannot_inject() {
        let mut lifecycle = PromptLifecycle::new("p-1");
        drive(
            &mut lifecycle,
            &[
                (LifecycleState::Routed, LifecycleActor::Router),
                (LifecycleState::AwaitingReply, LifecycleActor::ReplyPath),
                (LifecycleState::ReplyReceived, LifecycleActor::ReplyPath),
            ],
        );
        let err = lifecycle
            .transition(LifecycleState::Injected, LifecycleActor::Router, None)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ActorNotPermitted { .. }));
    }

    #[test]
    fn only_sweeper_expires() {
        let mut lifecycle = PromptLifecycle::new("p-1");
        let err = lifecycle
            .transition(LifecycleState::Expired, LifecycleActor::Executor, None)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::ActorNotPermitted { .. }));
    }

    proptest! {
        #[test]
        fn any_attempt_sequence_is_monotonic(
            attempts in prop::collection::vec((0usize..9, 0usize..5), 0..40)
        ) {
            let mut lifecycle = PromptLifecycle::new("p-prop");
            let mut last_rank = lifecycle.state().rank();
            let mut seen = vec![lifecycle.state()];

            for (state_idx, actor_idx) in attempts {
                let _ = lifecycle.transition(ALL_STATES[state_idx], ALL_ACTORS[actor_idx], None);
                let rank = lifecycle.state().rank();
                prop_assert!(rank >= last_rank);
                last_rank = rank;
                if seen.last() != Some(&lifecycle.state()) {
                    prop_assert!(!seen.contains(&lifecycle.state()));
                    seen.push(lifecycle.state());
                }
            }

            let terminals = seen.iter().filter(|s| s.is_terminal()).count();
            prop_assert!(terminals <= 1);
            for transition in lifecycle.history() {
                prop_assert!(transition.from.can_transition_to(transition.to));
            }
        }
    }
}
