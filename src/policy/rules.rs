use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RuleLoadError;
use crate::prompt::{ConfidenceTier, PromptType};

/// Rule id reserved for the fallback decision.
pub const DEFAULT_RULE_ID: &str = "default";

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
pub enum RuleAction {
    Allow,
    Deny,
    Escalate,
    RequireHuman,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSpec {
    pub max: u32,
    pub window_secs: u64,
}

/// A rule as written in `rules.toml`, before `extends` is resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompt_types: Vec<PromptType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_confidence: Option<ConfidenceTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_confidence: Option<ConfidenceTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub none_of: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RuleAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
}

impl RuleSpec {
    /// Overlay `self` (the child) on an already-resolved parent.
    fn merged_over(&self, parent: &RuleSpec) -> RuleSpec {
        fn pick<T: Clone>(child: &Option<T>, parent: &Option<T>) -> Option<T> {
            child.clone().or_else(|| parent.clone())
        }
        fn pick_list<T: Clone>(child: &[T], parent: &[T]) -> Vec<T> {
            if child.is_empty() {
                parent.to_vec()
            } else {
                child.to_vec()
            }
        }

        RuleSpec {
            id: self.id.clone(),
            description: pick(&self.description, &parent.description),
            prompt_types: pick_list(&self.prompt_types, &parent.prompt_types),
            min_confidence: pick(&self.min_confidence, &parent.min_confidence),
            max_confidence: pick(&self.max_confidence, &parent.max_confidence),
            session_tag: pick(&self.session_tag, &parent.session_tag),
            any_of: pick_list(&self.any_of, &parent.any_of),
            none_of: pick_list(&self.none_of, &parent.none_of),
            action: pick(&self.action, &parent.action),
            reply: pick(&self.reply, &parent.reply),
            rate_limit: pick(&self.rate_limit, &parent.rate_limit),
            extends: self.extends.clone(),
            is_abstract: self.is_abstract,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleSpec>,
}

/// A compiled predicate pattern; keeps its source for explanations.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub source: String,
    pub regex: Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

/// A resolved, validated, evaluable rule.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub id: String,
    pub description: Option<String>,
    /// Declared position in the rule file; evaluation follows it.
    pub position: usize,
    pub prompt_types: Vec<PromptType>,
    pub min_confidence: Option<ConfidenceTier>,
    pub max_confidence: Option<ConfidenceTier>,
    pub session_tag: Option<String>,
    pub any_of: Arc<[CompiledPattern]>,
    pub none_of: Arc<[CompiledPattern]>,
    pub action: RuleAction,
    pub reply: Option<String>,
    pub rate_limit: Option<RateLimit>,
    pub extends: Option<String>,
    /// The merged spec this rule was compiled from.
    pub resolved: RuleSpec,
}

impl PolicyRule {
    pub fn has_patterns(&self) -> bool {
        !self.any_of.is_empty() || !self.none_of.is_empty()
    }
}

/// Ordered, immutable ruleset. Swapped as a whole on reload.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<PolicyRule>,
    fingerprint: String,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            fingerprint: fingerprint_of(b""),
        }
    }

    pub fn from_toml(text: &str, max_pattern_size: usize) -> Result<Self, RuleLoadError> {
        let file: RuleFile =
            toml::from_str(text).map_err(|e| RuleLoadError::Parse(e.to_string()))?;
        let mut set = Self::from_specs(file.rules, max_pattern_size)?;
        set.fingerprint = fingerprint_of(text.as_bytes());
        Ok(set)
    }

    /// Validate and resolve rules. Every `extends` cycle, unknown parent,
    /// duplicate id and bad pattern is rejected here, never at evaluation.
    pub fn from_specs(specs: Vec<RuleSpec>, max_pattern_size: usize) -> Result<Self, RuleLoadError> {
        let mut by_id: HashMap<&str, &RuleSpec> = HashMap::with_capacity(specs.len());
        for spec in &specs {
            let id = spec.id.trim();
            if id.is_empty() || id == DEFAULT_RULE_ID {
                return Err(RuleLoadError::ReservedId(DEFAULT_RULE_ID.to_string()));
            }
            if by_id.insert(spec.id.as_str(), spec).is_some() {
                return Err(RuleLoadError::DuplicateId(spec.id.clone()));
            }
        }

        let mut rules = Vec::new();
        for (position, spec) in specs.iter().enumerate() {
            let resolved = resolve(spec, &by_id)?;
            let compiled = compile(resolved, position, max_pattern_size)?;
            if let Some(rule) = compiled {
                rules.push(rule);
            }
        }

        let encoded = serde_json::to_vec(&specs).unwrap_or_default();
        Ok(Self {
            rules,
            fingerprint: fingerprint_of(&encoded),
        })
    }

    /// Concrete rules in evaluation order.
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn fingerprint_of(bytes: &[u8]) -> String {
    hex::encode(&Sha256::digest(bytes)[..8])
}

/// Merge the `extends` chain root-first into one spec.
fn resolve(spec: &RuleSpec, by_id: &HashMap<&str, &RuleSpec>) -> Result<RuleSpec, RuleLoadError> {
    let mut chain: Vec<&RuleSpec> = vec![spec];
    let mut current = spec;
    while let Some(parent_id) = current.extends.as_deref() {
        let parent = by_id
            .get(parent_id)
            .copied()
            .ok_or_else(|| RuleLoadError::UnknownParent {
                rule_id: current.id.clone(),
                parent: parent_id.to_string(),
            })?;
        if chain.iter().any(|seen| seen.id == parent.id) {
            let mut ids: Vec<String> = chain.iter().map(|s| s.id.clone()).collect();
            ids.push(parent.id.clone());
            return Err(RuleLoadError::CyclicExtends { chain: ids });
        }
        chain.push(parent);
        current = parent;
    }

    let mut iter = chain.into_iter().rev();
    let root = iter.next().map(Clone::clone).unwrap_or_default();
    Ok(iter.fold(root, |acc, child| child.merged_over(&acc)))
}

fn compile(
    resolved: RuleSpec,
    position: usize,
    max_pattern_size: usize,
) -> Result<Option<PolicyRule>, RuleLoadError> {
    if let (Some(min), Some(max)) = (resolved.min_confidence, resolved.max_confidence)
        && min > max
    {
        return Err(RuleLoadError::InvertedConfidence {
            rule_id: resolved.id.clone(),
        });
    }
    if let Some(limit) = resolved.rate_limit {
        if limit.max == 0 {
            return Err(RuleLoadError::InvalidRateLimit {
                rule_id: resolved.id.clone(),
                reason: "max must be >= 1".into(),
            });
        }
        if limit.window_secs == 0 {
            return Err(RuleLoadError::InvalidRateLimit {
                rule_id: resolved.id.clone(),
                reason: "window_secs must be >= 1".into(),
            });
        }
    }

    let any_of = compile_patterns(&resolved.id, &resolved.any_of, max_pattern_size)?;
    let none_of = compile_patterns(&resolved.id, &resolved.none_of, max_pattern_size)?;

    if resolved.is_abstract {
        return Ok(None);
    }
    let action = resolved
        .action
        .ok_or_else(|| RuleLoadError::MissingAction(resolved.id.clone()))?;

    Ok(Some(PolicyRule {
        id: resolved.id.clone(),
        description: resolved.description.clone(),
        position,
        prompt_types: resolved.prompt_types.clone(),
        min_confidence: resolved.min_confidence,
        max_confidence: resolved.max_confidence,
        session_tag: resolved.session_tag.clone(),
        any_of: any_of.into(),
        none_of: none_of.into(),
        action,
        reply: resolved.reply.clone(),
        rate_limit: resolved.rate_limit.map(|limit| RateLimit {
            max: limit.max,
            window: Duration::from_secs(limit.window_secs),
        }),
        extends: resolved.extends.clone(),
        resolved,
    }))
}

fn compile_patterns(
    rule_id: &str,
    sources: &[String],
    max_pattern_size: usize,
) -> Result<Vec<CompiledPattern>, RuleLoadError> {
    sources
        .iter()
        .map(|source| {
            RegexBuilder::new(source)
                .size_limit(max_pattern_size)
                .build()
                .map(|regex| CompiledPattern {
                    source: source.clone(),
                    regex,
                })
                .map_err(|e| RuleLoadError::InvalidPattern {
                    rule_id: rule_id.to_string(),
                    pattern: source.clone(),
                    reason: e.to_string(),
                })
        })
        .collect()
}
