use crate::cache::{NoCache, PermissionCache};
use crate::context::{ContextBuilder, EvaluationContext, TenantRef, TenantStatus};
use crate::error::{Error, Result, StoreError};
use crate::hooks::{GlobalHook, GlobalHookManager};
use crate::permission::code_matches;
use crate::plugin::{Plugin, PluginManager, PluginStatus};
use crate::policy::{Effect, PolicyDefinition, PolicyMatch, PolicySet};
use crate::rbac::RbacEvaluator;
use crate::store::RbacStore;
use crate::types::{ResourceName, SubjectId, SubjectKind, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Operation name global hooks observe for permission checks.
pub const CHECK_OPERATION: &str = "check";

/// A registered resource: a name, the actions it supports and free-form
/// metadata. Registration drives permission-code discovery and the
/// resource-registered callbacks; the gate itself attaches no behavior
/// to a resource beyond bookkeeping.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ResourceDefinition {
    pub name: ResourceName,
    pub description: Option<String>,
    /// Action segments this resource supports (`read`, `create`, ...).
    pub actions: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ResourceDefinition {
    pub fn new(name: ResourceName) -> Self {
        Self {
            name,
            description: None,
            actions: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declares a supported action.
    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Permission codes formed from this resource's declared actions.
    pub fn permission_codes(&self) -> Vec<String> {
        self.actions
            .iter()
            .map(|action| format!("{}:{action}", self.name))
            .collect()
    }
}

struct ResourceEntry {
    definition: ResourceDefinition,
    hooks: Vec<Arc<dyn GlobalHook>>,
}

#[derive(Default)]
struct RegistryState {
    resources: BTreeMap<ResourceName, ResourceEntry>,
    /// Handed out to checks by handle; registration replaces it
    /// copy-on-write, so an outstanding snapshot never observes the
    /// change and no check pays a clone.
    policies: Arc<PolicySet>,
    frozen: bool,
}

/// Resource and policy registry, mutable until the gate initializes.
#[derive(Clone, Default)]
pub(crate) struct SharedRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl SharedRegistry {
    fn register_resource(&self, definition: ResourceDefinition) -> Result<ResourceDefinition> {
        let mut state = self.inner.write().expect("poisoned lock");
        ensure_mutable(&state, "register_resource")?;
        if state.resources.contains_key(&definition.name) {
            return Err(Error::DuplicateResource {
                resource: definition.name,
            });
        }
        let name = definition.name.clone();
        state.resources.insert(
            name,
            ResourceEntry {
                definition: definition.clone(),
                hooks: Vec::new(),
            },
        );
        debug!(resource = %definition.name, "resource registered");
        Ok(definition)
    }

    fn register_policy(&self, definition: PolicyDefinition) -> Result<()> {
        let mut state = self.inner.write().expect("poisoned lock");
        ensure_mutable(&state, "register_policy")?;
        let id = definition.id.clone();
        Arc::make_mut(&mut state.policies).register(definition)?;
        debug!(policy = %id, "policy registered");
        Ok(())
    }

    fn extend_resource_hooks(
        &self,
        resource: &ResourceName,
        hooks: Vec<Arc<dyn GlobalHook>>,
    ) -> Result<()> {
        let mut state = self.inner.write().expect("poisoned lock");
        ensure_mutable(&state, "extend_resource_hooks")?;
        let Some(entry) = state.resources.get_mut(resource) else {
            return Err(Error::ResourceNotFound {
                resource: resource.clone(),
            });
        };
        entry.hooks.extend(hooks);
        Ok(())
    }

    fn list_resources(&self) -> Vec<ResourceDefinition> {
        self.inner
            .read()
            .expect("poisoned lock")
            .resources
            .values()
            .map(|entry| entry.definition.clone())
            .collect()
    }

    fn resource(&self, name: &ResourceName) -> Option<ResourceDefinition> {
        self.inner
            .read()
            .expect("poisoned lock")
            .resources
            .get(name)
            .map(|entry| entry.definition.clone())
    }

    fn resource_hooks(&self, name: &ResourceName) -> Vec<Arc<dyn GlobalHook>> {
        self.inner
            .read()
            .expect("poisoned lock")
            .resources
            .get(name)
            .map(|entry| entry.hooks.clone())
            .unwrap_or_default()
    }

    fn grant_patterns_for(&self, tenant: &TenantId) -> BTreeSet<String> {
        self.inner
            .read()
            .expect("poisoned lock")
            .policies
            .grant_patterns_for(tenant)
    }

    fn policy_snapshot(&self) -> Arc<PolicySet> {
        Arc::clone(&self.inner.read().expect("poisoned lock").policies)
    }

    fn freeze(&self) {
        self.inner.write().expect("poisoned lock").frozen = true;
    }

    fn is_frozen(&self) -> bool {
        self.inner.read().expect("poisoned lock").frozen
    }

    fn counts(&self) -> (usize, usize) {
        let state = self.inner.read().expect("poisoned lock");
        (state.resources.len(), state.policies.len())
    }
}

fn ensure_mutable(state: &RegistryState, operation: &'static str) -> Result<()> {
    if state.frozen {
        return Err(Error::RegistryFrozen { operation });
    }
    Ok(())
}

/// Handle returned by [`PluginContext::on_resource_registered`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

type ResourceCallback = dyn Fn(&ResourceDefinition) + Send + Sync;

#[derive(Default)]
struct SubscriptionState {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, Arc<ResourceCallback>)>,
}

#[derive(Clone, Default)]
struct SubscriptionSet {
    inner: Arc<RwLock<SubscriptionState>>,
}

impl SubscriptionSet {
    fn subscribe(&self, callback: Arc<ResourceCallback>) -> SubscriptionId {
        let mut state = self.inner.write().expect("poisoned lock");
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.callbacks.push((id, callback));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.inner.write().expect("poisoned lock");
        let before = state.callbacks.len();
        state.callbacks.retain(|(existing, _)| *existing != id);
        state.callbacks.len() != before
    }

    fn notify(&self, definition: &ResourceDefinition) {
        // Snapshot before calling out so a callback can subscribe or
        // unsubscribe without deadlocking.
        let callbacks: Vec<Arc<ResourceCallback>> = self
            .inner
            .read()
            .expect("poisoned lock")
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(definition);
        }
    }
}

/// Registration surface handed to plugins during install.
///
/// It is a cheap cloneable handle onto the gate's registry, hook manager
/// and subscription list; everything registered through it lands in the
/// owning gate.
#[derive(Clone)]
pub struct PluginContext {
    registry: SharedRegistry,
    hooks: GlobalHookManager,
    subscriptions: SubscriptionSet,
}

impl PluginContext {
    /// Registers a resource and fires the registered callbacks.
    pub fn register_resource(&self, definition: ResourceDefinition) -> Result<()> {
        let definition = self.registry.register_resource(definition)?;
        self.subscriptions.notify(&definition);
        Ok(())
    }

    /// Compiles and registers a policy.
    pub fn register_policy(&self, definition: PolicyDefinition) -> Result<()> {
        self.registry.register_policy(definition)
    }

    /// Appends global hooks in order.
    pub fn register_global_hooks(&self, hooks: impl IntoIterator<Item = Arc<dyn GlobalHook>>) {
        self.hooks.register_all(hooks);
    }

    /// Attaches hooks to one registered resource. The gate stores them
    /// for adapters to run around that resource's operations; they are
    /// not part of the permission-check pipeline.
    pub fn extend_resource_hooks(
        &self,
        resource: &ResourceName,
        hooks: impl IntoIterator<Item = Arc<dyn GlobalHook>>,
    ) -> Result<()> {
        self.registry
            .extend_resource_hooks(resource, hooks.into_iter().collect())
    }

    pub fn list_resources(&self) -> Vec<ResourceDefinition> {
        self.registry.list_resources()
    }

    /// Registers a callback fired on every subsequent resource
    /// registration. Returns an id for [`PluginContext::unsubscribe`].
    pub fn on_resource_registered(
        &self,
        callback: impl Fn(&ResourceDefinition) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscriptions.subscribe(Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }
}

/// The seam between the gate and whatever resolves a subject's granted
/// permission patterns. Wire it to [`RbacResolver`] for store-backed
/// role resolution or provide any other source.
#[async_trait]
pub trait PermissionResolver: Send + Sync {
    async fn resolve_permissions(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
        as_of: DateTime<Utc>,
    ) -> std::result::Result<BTreeSet<String>, StoreError>;
}

/// [`PermissionResolver`] backed by an [`RbacEvaluator`].
pub struct RbacResolver<S, C = NoCache> {
    evaluator: Arc<RbacEvaluator<S, C>>,
}

impl<S, C> RbacResolver<S, C> {
    pub fn new(evaluator: Arc<RbacEvaluator<S, C>>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl<S, C> PermissionResolver for RbacResolver<S, C>
where
    S: RbacStore,
    C: PermissionCache,
{
    async fn resolve_permissions(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
        as_of: DateTime<Utc>,
    ) -> std::result::Result<BTreeSet<String>, StoreError> {
        let effective = self
            .evaluator
            .effective_permissions(tenant, subject_kind, subject, as_of)
            .await
            .map_err(Into::<StoreError>::into)?;
        Ok(effective.permissions)
    }
}

/// Default resolver: the unconditional allow patterns of the registered
/// policies, so a gate without a store still answers permission-set
/// checks consistently with its policies.
struct PolicyBackedResolver {
    registry: SharedRegistry,
}

#[async_trait]
impl PermissionResolver for PolicyBackedResolver {
    async fn resolve_permissions(
        &self,
        tenant: &TenantId,
        _subject_kind: SubjectKind,
        _subject: &SubjectId,
        _as_of: DateTime<Utc>,
    ) -> std::result::Result<BTreeSet<String>, StoreError> {
        Ok(self.registry.grant_patterns_for(tenant))
    }
}

/// Source of externally-held policies merged into evaluation per check.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn get_policies(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
    ) -> std::result::Result<Vec<PolicyDefinition>, StoreError>;

    /// Drops any provider-side caching for the subject, or the whole
    /// tenant when `subject` is `None`.
    async fn invalidate(&self, _tenant: &TenantId, _subject: Option<&SubjectId>) {}
}

/// How [`Gate::check_permission`] combines its two decision sources.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CheckStrategy {
    /// Resolved permission patterns only.
    PermissionSet,
    /// Policy rules only.
    Policies,
    /// Policies first; an explicit rule match wins either way, otherwise
    /// the permission set decides.
    #[default]
    Combined,
}

/// Which stage produced the decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    System,
    Hook,
    Policy,
    PermissionSet,
    Default,
}

/// Structured outcome of a permission check.
#[derive(Clone, Debug, serde::Serialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub reason: String,
    pub source: DecisionSource,
    /// Present when a policy rule decided.
    pub policy: Option<PolicyMatch>,
    pub request_id: String,
    pub elapsed: Duration,
}

struct Verdict {
    allowed: bool,
    reason: String,
    source: DecisionSource,
    policy: Option<PolicyMatch>,
}

impl Verdict {
    fn allow(reason: String, source: DecisionSource) -> Self {
        Self {
            allowed: true,
            reason,
            source,
            policy: None,
        }
    }

    fn deny(reason: String, source: DecisionSource) -> Self {
        Self {
            allowed: false,
            reason,
            source,
            policy: None,
        }
    }
}

/// Builder for [`Gate`].
#[derive(Default)]
pub struct GateBuilder {
    resolver: Option<Arc<dyn PermissionResolver>>,
    provider: Option<Arc<dyn PolicyProvider>>,
    strategy: CheckStrategy,
}

impl GateBuilder {
    /// Sets the permission resolver; defaults to a policy-backed one.
    pub fn resolver(mut self, resolver: impl PermissionResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Attaches an external policy source.
    pub fn policy_provider(mut self, provider: impl PolicyProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Sets the decision strategy.
    pub fn strategy(mut self, strategy: CheckStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Builds the gate.
    pub fn build(self) -> Gate {
        let registry = SharedRegistry::default();
        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(PolicyBackedResolver {
                registry: registry.clone(),
            })
        });
        Gate {
            registry,
            subscriptions: SubscriptionSet::default(),
            hooks: GlobalHookManager::new(),
            plugins: PluginManager::new(),
            resolver,
            provider: self.provider,
            strategy: self.strategy,
            initialized: false,
        }
    }
}

/// The authorization orchestrator.
///
/// Owns the resource/policy registry, the global hook manager and the
/// plugin manager. The registry accepts registrations until [`Gate::init`]
/// runs; `init` installs every registered plugin (which may register
/// further resources, policies and hooks) and then freezes the registry,
/// after which checks run against an immutable configuration.
pub struct Gate {
    registry: SharedRegistry,
    subscriptions: SubscriptionSet,
    hooks: GlobalHookManager,
    plugins: PluginManager,
    resolver: Arc<dyn PermissionResolver>,
    provider: Option<Arc<dyn PolicyProvider>>,
    strategy: CheckStrategy,
    initialized: bool,
}

impl Default for Gate {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Gate {
    pub fn builder() -> GateBuilder {
        GateBuilder::default()
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Registration handle usable by plugins and embedding code alike.
    pub fn plugin_context(&self) -> PluginContext {
        PluginContext {
            registry: self.registry.clone(),
            hooks: self.hooks.clone(),
            subscriptions: self.subscriptions.clone(),
        }
    }

    /// The global hook manager; register hooks through it.
    pub fn hooks(&self) -> &GlobalHookManager {
        &self.hooks
    }

    pub fn register_resource(&self, definition: ResourceDefinition) -> Result<()> {
        self.plugin_context().register_resource(definition)
    }

    pub fn register_policy(&self, definition: PolicyDefinition) -> Result<()> {
        self.plugin_context().register_policy(definition)
    }

    pub fn extend_resource_hooks(
        &self,
        resource: &ResourceName,
        hooks: impl IntoIterator<Item = Arc<dyn GlobalHook>>,
    ) -> Result<()> {
        self.plugin_context().extend_resource_hooks(resource, hooks)
    }

    pub fn list_resources(&self) -> Vec<ResourceDefinition> {
        self.registry.list_resources()
    }

    pub fn resource(&self, name: &ResourceName) -> Option<ResourceDefinition> {
        self.registry.resource(name)
    }

    /// Hooks attached to one resource via `extend_resource_hooks`, for
    /// adapters that run per-resource pipelines.
    pub fn resource_hooks(&self, name: &ResourceName) -> Vec<Arc<dyn GlobalHook>> {
        self.registry.resource_hooks(name)
    }

    pub fn on_resource_registered(
        &self,
        callback: impl Fn(&ResourceDefinition) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscriptions.subscribe(Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    /// Registers a plugin; it installs at [`Gate::init`] time.
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.plugins.register(plugin)
    }

    /// Installs one plugin (and its dependencies) immediately.
    pub async fn install_plugin(&mut self, name: &str) -> Result<()> {
        let ctx = self.plugin_context();
        self.plugins.install(name, &ctx).await
    }

    pub async fn uninstall_plugin(&mut self, name: &str) -> Result<()> {
        self.plugins.uninstall(name).await
    }

    pub fn plugin_states(&self) -> Vec<PluginStatus> {
        self.plugins.states()
    }

    /// Installs every registered plugin in dependency order, then
    /// freezes the registry. Idempotent once it has succeeded; on
    /// failure nothing freezes and a retry picks up where the installs
    /// left off.
    pub async fn init(&mut self) -> Result<()> {
        if self.initialized {
            debug!("gate already initialized");
            return Ok(());
        }
        let ctx = self.plugin_context();
        self.plugins.install_all(&ctx).await?;
        self.registry.freeze();
        self.initialized = true;
        let (resources, policies) = self.registry.counts();
        info!(resources, policies, plugins = self.plugins.len(), "gate initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Starts an evaluation context for the tenant; the builder fills in
    /// an anonymous subject, a generated request id and the current
    /// instant unless overridden.
    pub fn create_context(&self, tenant: TenantRef) -> ContextBuilder {
        EvaluationContext::builder(tenant)
    }

    /// Answers the permission check carried by `ctx`.
    ///
    /// Evaluation is fail-closed and cannot error; the only `Err` this
    /// returns is a `before`/`after` hook failure, which is reported to
    /// the error hooks first and then propagated.
    pub async fn check_permission(&self, ctx: &EvaluationContext) -> Result<CheckResult> {
        let started = Instant::now();
        if ctx.subject.kind == SubjectKind::System {
            return Ok(self.finish(
                ctx,
                started,
                Verdict::allow("system subject".to_string(), DecisionSource::System),
            ));
        }
        let resource = resource_segment(&ctx.permission);
        match self.run_check(ctx, resource, started).await {
            Ok(result) => Ok(result),
            Err(error) => {
                self.hooks
                    .run_on_error(ctx, CHECK_OPERATION, resource, &error)
                    .await;
                Err(error)
            }
        }
    }

    /// Like [`Gate::check_permission`] but turns a denial into
    /// [`Error::PermissionDenied`].
    pub async fn require_permission(&self, ctx: &EvaluationContext) -> Result<CheckResult> {
        let result = self.check_permission(ctx).await?;
        if !result.allowed {
            return Err(Error::PermissionDenied {
                code: ctx.permission.clone(),
                reason: result.reason,
            });
        }
        Ok(result)
    }

    async fn run_check(
        &self,
        ctx: &EvaluationContext,
        resource: &str,
        started: Instant,
    ) -> Result<CheckResult> {
        if ctx.permission.is_empty() {
            return Ok(self.finish(
                ctx,
                started,
                Verdict::deny("no permission requested".to_string(), DecisionSource::Default),
            ));
        }
        if ctx.tenant.status == TenantStatus::Suspended {
            return Ok(self.finish(
                ctx,
                started,
                Verdict::deny("tenant suspended".to_string(), DecisionSource::Default),
            ));
        }

        if let Some(halted) = self.hooks.run_before(ctx, CHECK_OPERATION, resource).await? {
            let reason = if halted.reason.is_empty() {
                format!("halted by hook {}", halted.hook)
            } else {
                halted.reason
            };
            return Ok(self.finish(ctx, started, Verdict::deny(reason, DecisionSource::Hook)));
        }

        let verdict = self.evaluate(ctx).await;
        let result = self.finish(ctx, started, verdict);
        let outcome = json!({
            "allowed": result.allowed,
            "reason": result.reason,
            "source": result.source,
        });
        self.hooks
            .run_after(ctx, CHECK_OPERATION, resource, &outcome)
            .await?;
        Ok(result)
    }

    async fn evaluate(&self, ctx: &EvaluationContext) -> Verdict {
        let verdict = match self.strategy {
            CheckStrategy::Policies => self.evaluate_policies(ctx).await,
            CheckStrategy::PermissionSet => self.evaluate_permission_set(ctx).await,
            CheckStrategy::Combined => match self.evaluate_policies(ctx).await {
                Some(verdict) => Some(verdict),
                None => self.evaluate_permission_set(ctx).await,
            },
        };
        verdict.unwrap_or_else(|| {
            Verdict::deny(
                "no matching grant or policy".to_string(),
                DecisionSource::Default,
            )
        })
    }

    /// Policy stage; `None` when no rule matched.
    async fn evaluate_policies(&self, ctx: &EvaluationContext) -> Option<Verdict> {
        let policies = self.policies_for(ctx).await;
        let evaluation = policies.evaluate(ctx).await;
        let matched = evaluation.matched?;
        let reason = match evaluation.effect {
            Effect::Allow => format!("allowed by policy {}", matched.policy),
            Effect::Deny => format!("denied by policy {}", matched.policy),
        };
        Some(Verdict {
            allowed: evaluation.effect == Effect::Allow,
            reason,
            source: DecisionSource::Policy,
            policy: Some(matched),
        })
    }

    /// Permission-set stage; `None` when no pattern matched.
    async fn evaluate_permission_set(&self, ctx: &EvaluationContext) -> Option<Verdict> {
        let resolved = self
            .resolver
            .resolve_permissions(
                &ctx.tenant.id,
                ctx.subject.kind,
                &ctx.subject.id,
                ctx.request.timestamp,
            )
            .await;
        let patterns = match resolved {
            Ok(patterns) => patterns,
            Err(error) => {
                warn!(
                    tenant = %ctx.tenant.id,
                    subject = %ctx.subject.id,
                    %error,
                    "permission resolver failed, denying"
                );
                return Some(Verdict::deny(
                    format!("permission resolution failed: {error}"),
                    DecisionSource::Default,
                ));
            }
        };
        let matched = patterns
            .iter()
            .map(String::as_str)
            .chain(ctx.subject.permissions.iter().map(String::as_str))
            .find(|pattern| code_matches(pattern, &ctx.permission))?;
        Some(Verdict::allow(
            format!("granted by {matched}"),
            DecisionSource::PermissionSet,
        ))
    }

    /// Registered policies, merged with provider-sourced ones when a
    /// provider is wired. Provider failures degrade to the registered
    /// set alone.
    async fn policies_for(&self, ctx: &EvaluationContext) -> Arc<PolicySet> {
        let snapshot = self.registry.policy_snapshot();
        let Some(provider) = &self.provider else {
            return snapshot;
        };
        match provider.get_policies(&ctx.tenant.id, &ctx.subject.id).await {
            Ok(external) if !external.is_empty() => {
                let mut merged = (*snapshot).clone();
                for definition in external {
                    let id = definition.id.clone();
                    if let Err(error) = merged.register(definition) {
                        debug!(policy = %id, %error, "skipping external policy");
                    }
                }
                Arc::new(merged)
            }
            Ok(_) => snapshot,
            Err(error) => {
                warn!(%error, "policy provider failed, using registered policies only");
                snapshot
            }
        }
    }

    fn finish(&self, ctx: &EvaluationContext, started: Instant, verdict: Verdict) -> CheckResult {
        debug!(
            permission = %ctx.permission,
            tenant = %ctx.tenant.id,
            subject = %ctx.subject.id,
            allowed = verdict.allowed,
            source = ?verdict.source,
            "permission check"
        );
        CheckResult {
            allowed: verdict.allowed,
            reason: verdict.reason,
            source: verdict.source,
            policy: verdict.policy,
            request_id: ctx.request.id.clone(),
            elapsed: started.elapsed(),
        }
    }
}

fn resource_segment(code: &str) -> &str {
    code.split_once(':').map(|(resource, _)| resource).unwrap_or(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Subject;
    use crate::hooks::HookDecision;
    use crate::policy::PolicyRule;
    use crate::types::PolicyId;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn user_ctx(permission: &str) -> EvaluationContext {
        EvaluationContext::builder(TenantRef::new(tenant()))
            .subject(Subject::user(SubjectId::new("u1").unwrap()))
            .permission(permission)
            .build()
    }

    fn policy(id: &str) -> PolicyDefinition {
        PolicyDefinition::new(PolicyId::new(id).unwrap())
    }

    fn resource_name(name: &str) -> ResourceName {
        ResourceName::new(name).unwrap()
    }

    struct FixedResolver(Vec<&'static str>);

    #[async_trait]
    impl PermissionResolver for FixedResolver {
        async fn resolve_permissions(
            &self,
            _tenant: &TenantId,
            _subject_kind: SubjectKind,
            _subject: &SubjectId,
            _as_of: DateTime<Utc>,
        ) -> std::result::Result<BTreeSet<String>, StoreError> {
            Ok(self.0.iter().map(|pattern| pattern.to_string()).collect())
        }
    }

    struct FailingResolver;

    #[async_trait]
    impl PermissionResolver for FailingResolver {
        async fn resolve_permissions(
            &self,
            _tenant: &TenantId,
            _subject_kind: SubjectKind,
            _subject: &SubjectId,
            _as_of: DateTime<Utc>,
        ) -> std::result::Result<BTreeSet<String>, StoreError> {
            Err("store offline".into())
        }
    }

    #[test]
    fn default_gate_denies_everything() {
        let gate = Gate::new();
        let result = block_on(gate.check_permission(&user_ctx("doc:read"))).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.source, DecisionSource::Default);
        assert!(!result.request_id.is_empty());
    }

    #[test]
    fn system_subject_short_circuits_to_allow() {
        let gate = Gate::new();
        gate.register_policy(policy("lockdown").rule(PolicyRule::deny(["*"])))
            .unwrap();

        // A halting hook proves the bypass happens before the pipeline.
        struct Wall;
        #[async_trait]
        impl GlobalHook for Wall {
            fn name(&self) -> &str {
                "wall"
            }
            async fn before(
                &self,
                _ctx: &EvaluationContext,
                _operation: &str,
                _resource: &str,
            ) -> std::result::Result<HookDecision, StoreError> {
                Ok(HookDecision::halt("no entry"))
            }
        }
        gate.hooks().register(Arc::new(Wall));

        let ctx = EvaluationContext::builder(TenantRef::new(tenant()))
            .subject(Subject::system())
            .permission("doc:purge")
            .build();
        let result = block_on(gate.check_permission(&ctx)).unwrap();
        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::System);
    }

    #[test]
    fn policy_rules_decide_with_policy_source() {
        let gate = Gate::new();
        gate.register_policy(
            policy("docs")
                .rule(PolicyRule::allow(["doc:read"]))
                .rule(PolicyRule::deny(["doc:purge"])),
        )
        .unwrap();

        let allowed = block_on(gate.check_permission(&user_ctx("doc:read"))).unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.source, DecisionSource::Policy);
        assert_eq!(allowed.policy.as_ref().unwrap().policy.as_str(), "docs");

        let denied = block_on(gate.check_permission(&user_ctx("doc:purge"))).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.source, DecisionSource::Policy);
    }

    #[test]
    fn combined_prefers_explicit_policy_over_permission_set() {
        let gate = Gate::builder()
            .resolver(FixedResolver(vec!["doc:*"]))
            .build();
        gate.register_policy(policy("lockdown").rule(PolicyRule::deny(["doc:write"])))
            .unwrap();

        let denied = block_on(gate.check_permission(&user_ctx("doc:write"))).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.source, DecisionSource::Policy);

        let allowed = block_on(gate.check_permission(&user_ctx("doc:read"))).unwrap();
        assert!(allowed.allowed);
        assert_eq!(allowed.source, DecisionSource::PermissionSet);
        assert_eq!(allowed.reason, "granted by doc:*");
    }

    #[test]
    fn permission_set_strategy_ignores_policies() {
        let gate = Gate::builder()
            .resolver(FixedResolver(vec!["doc:read"]))
            .strategy(CheckStrategy::PermissionSet)
            .build();
        gate.register_policy(policy("lockdown").rule(PolicyRule::deny(["doc:read"])))
            .unwrap();

        let result = block_on(gate.check_permission(&user_ctx("doc:read"))).unwrap();
        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::PermissionSet);
    }

    #[test]
    fn policies_strategy_never_consults_the_resolver() {
        let gate = Gate::builder()
            .resolver(FixedResolver(vec!["doc:read"]))
            .strategy(CheckStrategy::Policies)
            .build();
        let result = block_on(gate.check_permission(&user_ctx("doc:read"))).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.source, DecisionSource::Default);
    }

    #[test]
    fn subject_direct_permissions_join_the_set() {
        let gate = Gate::new();
        let ctx = EvaluationContext::builder(TenantRef::new(tenant()))
            .subject(
                Subject::user(SubjectId::new("u1").unwrap()).with_permission("report:export"),
            )
            .permission("report:export")
            .build();
        let result = block_on(gate.check_permission(&ctx)).unwrap();
        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::PermissionSet);
    }

    #[test]
    fn resolver_failure_degrades_to_deny() {
        let gate = Gate::builder().resolver(FailingResolver).build();
        let result = block_on(gate.check_permission(&user_ctx("doc:read"))).unwrap();
        assert!(!result.allowed);
        assert!(result.reason.contains("permission resolution failed"));
    }

    #[test]
    fn suspended_tenant_and_empty_code_deny_without_hooks() {
        let gate = Gate::new();
        let before_calls = Arc::new(AtomicUsize::new(0));

        struct Counting(Arc<AtomicUsize>);
        #[async_trait]
        impl GlobalHook for Counting {
            fn name(&self) -> &str {
                "counting"
            }
            async fn before(
                &self,
                _ctx: &EvaluationContext,
                _operation: &str,
                _resource: &str,
            ) -> std::result::Result<HookDecision, StoreError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(HookDecision::Proceed)
            }
        }
        gate.hooks().register(Arc::new(Counting(Arc::clone(&before_calls))));

        let suspended = EvaluationContext::builder(
            TenantRef::new(tenant()).with_status(TenantStatus::Suspended),
        )
        .subject(Subject::user(SubjectId::new("u1").unwrap()))
        .permission("doc:read")
        .build();
        let result = block_on(gate.check_permission(&suspended)).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.reason, "tenant suspended");

        let result = block_on(gate.check_permission(&user_ctx(""))).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.reason, "no permission requested");

        assert_eq!(before_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn halting_hook_denies_with_hook_source() {
        let gate = Gate::new();
        gate.register_policy(policy("grant").rule(PolicyRule::allow(["doc:read"])))
            .unwrap();
        let after_calls = Arc::new(AtomicUsize::new(0));

        struct Guard {
            after_calls: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl GlobalHook for Guard {
            fn name(&self) -> &str {
                "guard"
            }
            async fn before(
                &self,
                _ctx: &EvaluationContext,
                _operation: &str,
                _resource: &str,
            ) -> std::result::Result<HookDecision, StoreError> {
                Ok(HookDecision::halt("rate limited"))
            }
            async fn after(
                &self,
                _ctx: &EvaluationContext,
                _operation: &str,
                _resource: &str,
                _outcome: &Value,
            ) -> std::result::Result<(), StoreError> {
                self.after_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        gate.hooks().register(Arc::new(Guard {
            after_calls: Arc::clone(&after_calls),
        }));

        let result = block_on(gate.check_permission(&user_ctx("doc:read"))).unwrap();
        assert!(!result.allowed);
        assert_eq!(result.source, DecisionSource::Hook);
        assert_eq!(result.reason, "rate limited");
        // The operation was short-circuited, so no after hook ran.
        assert_eq!(after_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn after_hook_failure_propagates_and_reaches_error_hooks() {
        let gate = Gate::new();
        let error_calls = Arc::new(AtomicUsize::new(0));

        struct Brittle {
            error_calls: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl GlobalHook for Brittle {
            fn name(&self) -> &str {
                "brittle"
            }
            async fn after(
                &self,
                _ctx: &EvaluationContext,
                _operation: &str,
                _resource: &str,
                _outcome: &Value,
            ) -> std::result::Result<(), StoreError> {
                Err("audit sink unavailable".into())
            }
            async fn on_error(
                &self,
                _ctx: &EvaluationContext,
                _operation: &str,
                _resource: &str,
                _error: &Error,
            ) -> std::result::Result<(), StoreError> {
                self.error_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        gate.hooks().register(Arc::new(Brittle {
            error_calls: Arc::clone(&error_calls),
        }));

        let err = block_on(gate.check_permission(&user_ctx("doc:read")))
            .expect_err("after hook failure must propagate");
        assert!(matches!(err, Error::HookFailed { ref hook, .. } if hook == "brittle"));
        assert_eq!(error_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_freezes_after_init() {
        let mut gate = Gate::new();
        gate.register_resource(ResourceDefinition::new(resource_name("doc")).action("read"))
            .unwrap();
        block_on(gate.init()).unwrap();
        assert!(gate.is_initialized());

        assert!(matches!(
            gate.register_resource(ResourceDefinition::new(resource_name("invoice"))),
            Err(Error::RegistryFrozen { .. })
        ));
        assert!(matches!(
            gate.register_policy(policy("late")),
            Err(Error::RegistryFrozen { .. })
        ));
        assert!(matches!(
            gate.extend_resource_hooks(&resource_name("doc"), Vec::new()),
            Err(Error::RegistryFrozen { .. })
        ));

        // init is idempotent once it has succeeded.
        block_on(gate.init()).unwrap();
    }

    #[test]
    fn checks_share_one_policy_set_between_registrations() {
        let gate = Gate::new();
        gate.register_policy(policy("docs").rule(PolicyRule::allow(["doc:read"])))
            .unwrap();

        let first = gate.registry.policy_snapshot();
        let second = gate.registry.policy_snapshot();
        assert!(Arc::ptr_eq(&first, &second));

        gate.register_policy(policy("reports").rule(PolicyRule::allow(["report:read"])))
            .unwrap();
        let third = gate.registry.policy_snapshot();
        assert!(!Arc::ptr_eq(&second, &third));
        assert_eq!(third.len(), 2);
        // A snapshot taken before the registration keeps its contents.
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn plugins_install_at_init_and_their_policies_apply() {
        struct DocsPlugin;

        #[async_trait]
        impl Plugin for DocsPlugin {
            fn name(&self) -> &str {
                "docs"
            }
            async fn install(
                &self,
                ctx: &PluginContext,
            ) -> std::result::Result<(), StoreError> {
                ctx.register_resource(
                    ResourceDefinition::new(ResourceName::new("doc").unwrap())
                        .action("read")
                        .action("write"),
                )?;
                ctx.register_policy(
                    PolicyDefinition::new(PolicyId::new("docs-default").unwrap())
                        .rule(PolicyRule::allow(["doc:read"])),
                )?;
                Ok(())
            }
        }

        let mut gate = Gate::new();
        gate.register_plugin(Arc::new(DocsPlugin)).unwrap();
        block_on(gate.init()).unwrap();

        assert_eq!(gate.list_resources().len(), 1);
        let state = &gate.plugin_states()[0];
        assert!(state.installed && state.initialized);

        let result = block_on(gate.check_permission(&user_ctx("doc:read"))).unwrap();
        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::Policy);
    }

    #[test]
    fn resource_callbacks_fire_until_unsubscribed() {
        let gate = Gate::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = gate.on_resource_registered(move |_definition| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        gate.register_resource(ResourceDefinition::new(resource_name("doc")))
            .unwrap();
        gate.register_resource(ResourceDefinition::new(resource_name("invoice")))
            .unwrap();
        assert!(gate.unsubscribe(id));
        assert!(!gate.unsubscribe(id));
        gate.register_resource(ResourceDefinition::new(resource_name("report")))
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn resource_hooks_are_stored_for_adapters() {
        struct Audit;
        #[async_trait]
        impl GlobalHook for Audit {
            fn name(&self) -> &str {
                "audit"
            }
        }

        let gate = Gate::new();
        assert!(matches!(
            gate.extend_resource_hooks(&resource_name("doc"), [Arc::new(Audit) as Arc<dyn GlobalHook>]),
            Err(Error::ResourceNotFound { .. })
        ));

        gate.register_resource(
            ResourceDefinition::new(resource_name("doc")).action("read"),
        )
        .unwrap();
        gate.extend_resource_hooks(
            &resource_name("doc"),
            [Arc::new(Audit) as Arc<dyn GlobalHook>],
        )
        .unwrap();
        assert_eq!(gate.resource_hooks(&resource_name("doc")).len(), 1);
        assert!(gate.resource_hooks(&resource_name("missing")).is_empty());
    }

    #[test]
    fn require_permission_raises_on_deny() {
        let gate = Gate::new();
        let err = block_on(gate.require_permission(&user_ctx("doc:read")))
            .expect_err("deny must raise");
        match err {
            Error::PermissionDenied { code, reason } => {
                assert_eq!(code, "doc:read");
                assert_eq!(reason, "no matching grant or policy");
            }
            other => panic!("unexpected error: {other}"),
        }

        gate.register_policy(policy("grant").rule(PolicyRule::allow(["doc:read"])))
            .unwrap();
        let result = block_on(gate.require_permission(&user_ctx("doc:read"))).unwrap();
        assert!(result.allowed);
    }

    #[test]
    fn provider_policies_merge_into_evaluation() {
        struct TenantPolicies;

        #[async_trait]
        impl PolicyProvider for TenantPolicies {
            async fn get_policies(
                &self,
                _tenant: &TenantId,
                _subject: &SubjectId,
            ) -> std::result::Result<Vec<PolicyDefinition>, StoreError> {
                Ok(vec![
                    PolicyDefinition::new(PolicyId::new("external").unwrap())
                        .rule(PolicyRule::allow(["report:read"])),
                ])
            }
        }

        let gate = Gate::builder().policy_provider(TenantPolicies).build();
        let result = block_on(gate.check_permission(&user_ctx("report:read"))).unwrap();
        assert!(result.allowed);
        assert_eq!(
            result.policy.as_ref().unwrap().policy.as_str(),
            "external"
        );
    }

    #[test]
    fn resource_definition_builds_permission_codes() {
        let definition = ResourceDefinition::new(resource_name("doc"))
            .with_description("documents")
            .action("read")
            .action("write");
        assert_eq!(definition.permission_codes(), vec!["doc:read", "doc:write"]);
    }
}
