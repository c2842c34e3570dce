//! Policy evaluation: an ordered, validated ruleset turned into one
//! decision per prompt.

mod evaluator;
mod matcher;
mod rules;
mod source;
mod trackers;

pub use evaluator::{Evaluation, PolicyAnomaly, PolicyDecision, PolicyEvaluator, SessionContext};
pub use matcher::{MatchOutcome, MatchPool, PatternEngine, RegexEngine, composite_match};
pub use rules::{
    CompiledPattern, DEFAULT_RULE_ID, PolicyRule, RateLimit, RateLimitSpec, RuleAction, RuleSet,
    RuleSpec,
};
pub use source::{FileRuleSource, InlineRuleSource, ReloadOutcome, RuleSetHandle, RuleSource};
pub use trackers::RuleRateLimiter;
