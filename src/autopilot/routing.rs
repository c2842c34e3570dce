use serde::{Deserialize, Serialize};
use strum::Display;

use super::state::{AutonomyMode, AutopilotLifecycle, AutopilotSnapshot};
use crate::policy::RuleAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Route {
    /// Carry out the policy decision without asking anyone.
    Autonomous,
    /// Notify a human and wait for their reply.
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingDecision {
    pub route: Route,
    /// The action the pipeline acts on; `off` mode rewrites everything to
    /// `require_human`.
    pub effective_action: RuleAction,
    pub reason: &'static str,
}

/// Decide who answers a prompt given the policy action and the current
/// autopilot snapshot.
pub fn route(action: RuleAction, snapshot: &AutopilotSnapshot) -> RoutingDecision {
    let human = |effective_action, reason| RoutingDecision {
        route: Route::Human,
        effective_action,
        reason,
    };

    match snapshot.lifecycle {
        AutopilotLifecycle::Stopped => return human(action, "autopilot stopped"),
        AutopilotLifecycle::Paused => return human(action, "autopilot paused"),
        AutopilotLifecycle::Running => {}
    }

    match (snapshot.mode, action) {
        (AutonomyMode::Off, _) => human(RuleAction::RequireHuman, "autonomy off"),
        (AutonomyMode::Assist, RuleAction::Allow) => RoutingDecision {
            route: Route::Autonomous,
            effective_action: action,
            reason: "assist: policy allows",
        },
        (AutonomyMode::Assist, _) => human(action, "assist: only allow runs unattended"),
        (AutonomyMode::Full, RuleAction::Allow | RuleAction::Deny) => RoutingDecision {
            route: Route::Autonomous,
            effective_action: action,
            reason: "full: policy decides",
        },
        (AutonomyMode::Full, _) => human(action, "full: rule asks for a human"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(lifecycle: AutopilotLifecycle, mode: AutonomyMode) -> AutopilotSnapshot {
        AutopilotSnapshot {
            lifecycle,
            mode,
            changed_at: Utc::now(),
            stop_reason: None,
        }
    }

    #[test]
    fn off_mode_requires_human_regardless_of_rule() {
        let snap = snapshot(AutopilotLifecycle::Running, AutonomyMode::Off);
        for action in [
            RuleAction::Allow,
            RuleAction::Deny,
            RuleAction::Escalate,
            RuleAction::RequireHuman,
        ] {
            let decision = route(action, &snap);
            assert_eq!(decision.route, Route::Human);
            assert_eq!(decision.effective_action, RuleAction::RequireHuman);
        }
    }

    #[test]
    fn assist_only_runs_allow() {
        let snap = snapshot(AutopilotLifecycle::Running, AutonomyMode::Assist);
        assert_eq!(route(RuleAction::Allow, &snap).route, Route::Autonomous);
        assert_eq!(route(RuleAction::Deny, &snap).route, Route::Human);
        assert_eq!(route(RuleAction::Escalate, &snap).route, Route::Human);
    }

    #[test]
    fn full_runs_policy_except_human_actions() {
        let snap = snapshot(AutopilotLifecycle::Running, AutonomyMode::Full);
        assert_eq!(route(RuleAction::Allow, &snap).route, Route::Autonomous);
        assert_eq!(route(RuleAction::Deny, &snap).route, Route::Autonomous);
        assert_eq!(route(RuleAction::RequireHuman, &snap).route, Route::Human);
        assert_eq!(route(RuleAction::Escalate, &snap).route, Route::Human);
    }

    #[test]
    fn paused_or_stopped_never_runs_autonomously() {
        for lifecycle in [AutopilotLifecycle::Paused, AutopilotLifecycle::Stopped] {
            let snap = snapshot(lifecycle, AutonomyMode::Full);
            let decision = route(RuleAction::Allow, &snap);
            assert_eq!(decision.route, Route::Human);
            assert_eq!(decision.effective_action, RuleAction::Allow);
        }
    }
}
