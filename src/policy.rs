use crate::condition::Condition;
use crate::context::EvaluationContext;
use crate::error::{Error, Result};
use crate::permission::{code_matches, validate_pattern};
use crate::types::{PolicyId, TenantId};
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Outcome of a matched rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority band for policies and rules, ascending.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl RulePriority {
    /// Numeric rank used for ordering, `Low` = 0 through `Critical` = 3.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// One allow/deny rule inside a policy definition.
///
/// `patterns` are grant patterns per the permission model; `conditions`
/// are AND-combined, so the rule matches only when the requested code
/// matches one of the patterns and every condition passes.
#[derive(Clone, Debug)]
pub struct PolicyRule {
    pub patterns: Vec<String>,
    pub effect: Effect,
    pub conditions: Vec<Condition>,
    pub priority: RulePriority,
    pub description: Option<String>,
}

impl PolicyRule {
    fn new<I, S>(effect: Effect, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
            effect,
            conditions: Vec::new(),
            priority: RulePriority::default(),
            description: None,
        }
    }

    /// Creates an allow rule over the given patterns.
    pub fn allow<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Effect::Allow, patterns)
    }

    /// Creates a deny rule over the given patterns.
    pub fn deny<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Effect::Deny, patterns)
    }

    /// Appends a gating condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Replaces the rule priority.
    pub fn with_priority(mut self, priority: RulePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a human-readable description, used in decision reasons.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A named, prioritized, optionally tenant-scoped set of rules.
#[derive(Clone, Debug)]
pub struct PolicyDefinition {
    pub id: PolicyId,
    pub rules: Vec<PolicyRule>,
    pub priority: RulePriority,
    pub enabled: bool,
    pub tenant: Option<TenantId>,
}

impl PolicyDefinition {
    /// Creates an enabled, global, normal-priority definition.
    pub fn new(id: PolicyId) -> Self {
        Self {
            id,
            rules: Vec::new(),
            priority: RulePriority::default(),
            enabled: true,
            tenant: None,
        }
    }

    /// Appends a rule.
    pub fn rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Replaces the policy priority.
    pub fn with_priority(mut self, priority: RulePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Scopes the policy to one tenant.
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Sets the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A validated, read-only policy ready for evaluation. Rebuilt whenever
/// its source definition changes.
#[derive(Clone, Debug)]
pub struct CompiledPolicy {
    id: PolicyId,
    rules: Vec<CompiledRule>,
    rank: u8,
    enabled: bool,
    tenant: Option<TenantId>,
}

#[derive(Clone, Debug)]
struct CompiledRule {
    patterns: Vec<String>,
    effect: Effect,
    conditions: Vec<Condition>,
    rank: u8,
    description: Option<String>,
}

impl CompiledPolicy {
    fn compile(definition: PolicyDefinition) -> Result<Self> {
        let mut rules = Vec::with_capacity(definition.rules.len());
        for rule in definition.rules {
            let mut patterns = Vec::with_capacity(rule.patterns.len());
            for pattern in rule.patterns {
                validate_pattern(&pattern)?;
                if !patterns.contains(&pattern) {
                    patterns.push(pattern);
                }
            }
            rules.push(CompiledRule {
                patterns,
                effect: rule.effect,
                conditions: rule.conditions,
                rank: rule.priority.rank(),
                description: rule.description,
            });
        }
        Ok(Self {
            id: definition.id,
            rules,
            rank: definition.priority.rank(),
            enabled: definition.enabled,
            tenant: definition.tenant,
        })
    }

    /// Returns the policy id.
    pub fn id(&self) -> &PolicyId {
        &self.id
    }

    /// Returns the numeric policy rank.
    pub fn rank(&self) -> u8 {
        self.rank
    }

    /// Returns whether the policy participates in evaluation.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the tenant scope, `None` for global policies.
    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    fn applies_to(&self, tenant: &TenantId) -> bool {
        self.enabled
            && self
                .tenant
                .as_ref()
                .is_none_or(|scoped| scoped.as_str() == tenant.as_str())
    }
}

/// Identifies the policy and rule that decided an evaluation.
#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolicyMatch {
    pub policy: PolicyId,
    /// Index of the rule within its policy's declared rule list.
    pub rule: usize,
    pub description: Option<String>,
}

/// Result of walking the registered policies for one context.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PolicyEvaluation {
    pub effect: Effect,
    /// Absent when no rule matched and the default deny applied.
    pub matched: Option<PolicyMatch>,
}

/// Ordered collection of compiled policies with deterministic evaluation.
///
/// Candidates are walked by descending policy priority, then descending
/// rule priority, with deny rules ahead of allow rules at equal rank and
/// registration order breaking remaining ties. The first matching rule
/// wins; no match at all is a deny.
#[derive(Clone, Debug, Default)]
pub struct PolicySet {
    policies: Vec<CompiledPolicy>,
}

impl PolicySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles and registers a definition; ids must be unique.
    pub fn register(&mut self, definition: PolicyDefinition) -> Result<()> {
        if self.position(&definition.id).is_some() {
            return Err(Error::DuplicatePolicy {
                policy: definition.id,
            });
        }
        self.policies.push(CompiledPolicy::compile(definition)?);
        Ok(())
    }

    /// Recompiles an existing definition in place, keeping its
    /// registration position.
    pub fn update(&mut self, definition: PolicyDefinition) -> Result<()> {
        let Some(index) = self.position(&definition.id) else {
            return Err(Error::PolicyNotFound {
                policy: definition.id,
            });
        };
        self.policies[index] = CompiledPolicy::compile(definition)?;
        Ok(())
    }

    /// Removes a policy.
    pub fn remove(&mut self, id: &PolicyId) -> Result<()> {
        let Some(index) = self.position(id) else {
            return Err(Error::PolicyNotFound { policy: id.clone() });
        };
        self.policies.remove(index);
        Ok(())
    }

    /// Toggles a policy without recompiling it.
    pub fn set_enabled(&mut self, id: &PolicyId, enabled: bool) -> Result<()> {
        let Some(index) = self.position(id) else {
            return Err(Error::PolicyNotFound { policy: id.clone() });
        };
        self.policies[index].enabled = enabled;
        Ok(())
    }

    /// Returns a registered policy.
    pub fn get(&self, id: &PolicyId) -> Option<&CompiledPolicy> {
        self.position(id).map(|index| &self.policies[index])
    }

    /// Returns all policies in registration order.
    pub fn policies(&self) -> &[CompiledPolicy] {
        &self.policies
    }

    /// Returns the number of registered policies.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Returns whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    fn position(&self, id: &PolicyId) -> Option<usize> {
        self.policies
            .iter()
            .position(|policy| policy.id.as_str() == id.as_str())
    }

    /// Evaluates the requested permission in `ctx` against every
    /// applicable policy. Never fails; the default outcome is deny.
    pub async fn evaluate(&self, ctx: &EvaluationContext) -> PolicyEvaluation {
        let mut candidates: Vec<(usize, usize)> = Vec::new();
        for (policy_index, policy) in self.policies.iter().enumerate() {
            if !policy.applies_to(&ctx.tenant.id) {
                continue;
            }
            for rule_index in 0..policy.rules.len() {
                candidates.push((policy_index, rule_index));
            }
        }
        // Deny ordered ahead of allow at equal rank; the sort is stable,
        // so registration and declaration order break remaining ties.
        candidates.sort_by_key(|&(policy_index, rule_index)| {
            let policy = &self.policies[policy_index];
            let rule = &policy.rules[rule_index];
            let deny_first = match rule.effect {
                Effect::Deny => 0u8,
                Effect::Allow => 1u8,
            };
            (Reverse(policy.rank), Reverse(rule.rank), deny_first)
        });

        for (policy_index, rule_index) in candidates {
            let policy = &self.policies[policy_index];
            let rule = &policy.rules[rule_index];
            if !rule
                .patterns
                .iter()
                .any(|pattern| code_matches(pattern, &ctx.permission))
            {
                continue;
            }
            if !all_conditions_hold(&rule.conditions, ctx).await {
                continue;
            }
            debug!(
                policy = %policy.id,
                rule = rule_index,
                effect = %rule.effect,
                permission = %ctx.permission,
                "policy rule matched"
            );
            return PolicyEvaluation {
                effect: rule.effect,
                matched: Some(PolicyMatch {
                    policy: policy.id.clone(),
                    rule: rule_index,
                    description: rule.description.clone(),
                }),
            };
        }

        debug!(permission = %ctx.permission, "no policy rule matched, default deny");
        PolicyEvaluation {
            effect: Effect::Deny,
            matched: None,
        }
    }

    /// Collects the allow patterns of unconditional rules applicable to
    /// the tenant. This feeds the default permission resolver; rules
    /// with conditions are skipped because no request context exists at
    /// resolution time.
    pub fn grant_patterns_for(&self, tenant: &TenantId) -> BTreeSet<String> {
        let mut patterns = BTreeSet::new();
        for policy in &self.policies {
            if !policy.applies_to(tenant) {
                continue;
            }
            for rule in &policy.rules {
                if rule.effect == Effect::Allow && rule.conditions.is_empty() {
                    patterns.extend(rule.patterns.iter().cloned());
                }
            }
        }
        patterns
    }
}

async fn all_conditions_hold(conditions: &[Condition], ctx: &EvaluationContext) -> bool {
    for condition in conditions {
        if !condition.evaluate(ctx).await {
            return false;
        }
    }
    true
}
