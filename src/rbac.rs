use crate::binding::{BindingManager, BindingOptions, RoleBinding};
use crate::cache::{NoCache, PermissionCache};
use crate::context::EvaluationContext;
use crate::error::{Error, Result};
use crate::permission::code_matches;
use crate::role::{RoleDefinition, RoleDraft, RoleManager, RoleStatus, RoleTemplate, RoleUpdate};
use crate::store::RbacStore;
use crate::types::{RoleId, SubjectId, SubjectKind, TenantId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

const DEFAULT_MAX_INHERIT_DEPTH: usize = 16;

/// The resolved union of permissions a subject holds through its active
/// bindings and inherited roles. This is the cache entry value.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct EffectivePermissions {
    /// Grant patterns, deduplicated.
    pub permissions: BTreeSet<String>,
    /// Every role that contributed, inherited ones included.
    pub roles: BTreeSet<RoleId>,
    /// Evaluation instant the set was computed for.
    pub computed_at: DateTime<Utc>,
}

impl EffectivePermissions {
    /// Returns the first pattern granting `code`, if any.
    pub fn grants(&self, code: &str) -> Option<&str> {
        self.permissions
            .iter()
            .map(String::as_str)
            .find(|pattern| code_matches(pattern, code))
    }
}

/// Outcome of [`RbacEvaluator::check`]. Never an error: lookup failures
/// degrade to a deny with the failure in `reason`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RbacCheckResult {
    pub allowed: bool,
    pub reason: String,
    /// Roles that fed the effective-permission computation.
    pub matched_roles: BTreeSet<RoleId>,
}

/// RBAC evaluator with pluggable store and optional cache.
///
/// Owns the role and binding managers and exposes mutation passthroughs
/// that keep the cache coherent: every mutation that can change a
/// computed set invalidates the affected entries.
pub struct RbacEvaluator<S, C = NoCache> {
    roles: RoleManager<S>,
    bindings: BindingManager<S>,
    cache: C,
    max_inherit_depth: usize,
}

/// Builder for [`RbacEvaluator`].
pub struct RbacEvaluatorBuilder<S, C = NoCache> {
    store: Arc<S>,
    cache: C,
    max_inherit_depth: usize,
    templates: Option<Vec<RoleTemplate>>,
}

impl<S> RbacEvaluatorBuilder<S, NoCache> {
    /// Creates a new builder with default configuration.
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
            cache: NoCache,
            max_inherit_depth: DEFAULT_MAX_INHERIT_DEPTH,
            templates: None,
        }
    }
}

impl<S, C> RbacEvaluatorBuilder<S, C> {
    /// Sets maximum inheritance depth.
    pub fn max_inherit_depth(mut self, depth: usize) -> Self {
        self.max_inherit_depth = depth;
        self
    }

    /// Overrides the built-in role templates; an empty list disables
    /// them.
    pub fn templates(mut self, templates: Vec<RoleTemplate>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Sets the cache implementation.
    pub fn cache<C2: PermissionCache>(self, cache: C2) -> RbacEvaluatorBuilder<S, C2> {
        RbacEvaluatorBuilder {
            store: self.store,
            cache,
            max_inherit_depth: self.max_inherit_depth,
            templates: self.templates,
        }
    }

    /// Builds the evaluator.
    pub fn build(self) -> RbacEvaluator<S, C>
    where
        S: RbacStore,
    {
        let roles = match self.templates {
            Some(templates) => RoleManager::with_templates(Arc::clone(&self.store), templates),
            None => RoleManager::new(Arc::clone(&self.store)),
        };
        RbacEvaluator {
            roles,
            bindings: BindingManager::new(self.store),
            cache: self.cache,
            max_inherit_depth: self.max_inherit_depth,
        }
    }
}

impl<S, C> RbacEvaluator<S, C>
where
    S: RbacStore,
    C: PermissionCache,
{
    /// Returns the role manager for read access.
    pub fn roles(&self) -> &RoleManager<S> {
        &self.roles
    }

    /// Returns the binding manager for read access.
    pub fn bindings(&self) -> &BindingManager<S> {
        &self.bindings
    }

    /// Resolves the subject's effective permissions at `as_of`.
    ///
    /// A fresh cache entry short-circuits the computation entirely.
    /// Otherwise active bindings seed a breadth-first walk over the
    /// inheritance graph and every reached role's patterns are unioned.
    /// Unknown and disabled roles are skipped; the depth guard is the
    /// only way this can fail besides store errors.
    pub async fn effective_permissions(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
        as_of: DateTime<Utc>,
    ) -> Result<EffectivePermissions> {
        if let Some(cached) = self
            .cache
            .get_permissions(tenant, subject_kind, subject)
            .await
        {
            return Ok(cached);
        }

        let bound = self
            .bindings
            .subject_roles(tenant.clone(), subject_kind, subject.clone(), as_of)
            .await?;
        let seeds: Vec<RoleId> = bound.into_iter().map(|binding| binding.role).collect();
        let (permissions, roles) = self.expand(tenant, seeds).await?;

        let effective = EffectivePermissions {
            permissions,
            roles,
            computed_at: as_of,
        };
        self.cache
            .set_permissions(tenant, subject_kind, subject, effective.clone())
            .await;
        Ok(effective)
    }

    async fn expand(
        &self,
        tenant: &TenantId,
        seeds: Vec<RoleId>,
    ) -> Result<(BTreeSet<String>, BTreeSet<RoleId>)> {
        let mut queue: VecDeque<(RoleId, usize)> =
            seeds.into_iter().map(|role| (role, 0)).collect();
        let mut visited: HashSet<RoleId> = HashSet::new();
        let mut permissions = BTreeSet::new();
        let mut roles = BTreeSet::new();

        while let Some((role, depth)) = queue.pop_front() {
            if !visited.insert(role.clone()) {
                continue;
            }
            let Some(definition) = self.roles.resolve_role(tenant, &role).await? else {
                debug!(%role, %tenant, "role missing during expansion, skipping");
                continue;
            };
            if definition.status == RoleStatus::Disabled {
                debug!(%role, %tenant, "role disabled, skipping");
                continue;
            }
            permissions.extend(definition.permissions.iter().cloned());
            roles.insert(role);

            let next_depth = depth + 1;
            for parent in definition.inherits {
                if visited.contains(&parent) {
                    continue;
                }
                if next_depth > self.max_inherit_depth {
                    return Err(Error::RoleDepthExceeded {
                        role: parent,
                        max_depth: self.max_inherit_depth,
                    });
                }
                queue.push_back((parent, next_depth));
            }
        }

        Ok((permissions, roles))
    }

    /// Answers the permission check carried by `ctx`. Never fails; any
    /// resolution error degrades to a deny.
    pub async fn check(&self, ctx: &EvaluationContext) -> RbacCheckResult {
        if ctx.permission.is_empty() {
            return RbacCheckResult {
                allowed: false,
                reason: "no permission requested".to_string(),
                matched_roles: BTreeSet::new(),
            };
        }
        match self
            .effective_permissions(
                &ctx.tenant.id,
                ctx.subject.kind,
                &ctx.subject.id,
                ctx.request.timestamp,
            )
            .await
        {
            Ok(effective) => {
                if let Some(pattern) = effective.grants(&ctx.permission) {
                    let reason = format!("granted by {pattern}");
                    RbacCheckResult {
                        allowed: true,
                        reason,
                        matched_roles: effective.roles,
                    }
                } else {
                    RbacCheckResult {
                        allowed: false,
                        reason: format!("no grant matches {}", ctx.permission),
                        matched_roles: BTreeSet::new(),
                    }
                }
            }
            Err(error) => {
                warn!(
                    tenant = %ctx.tenant.id,
                    subject = %ctx.subject.id,
                    %error,
                    "permission resolution failed, denying"
                );
                RbacCheckResult {
                    allowed: false,
                    reason: format!("permission resolution failed: {error}"),
                    matched_roles: BTreeSet::new(),
                }
            }
        }
    }

    /// Returns the effective permission patterns as plain strings, a
    /// convenience projection for adapters.
    pub async fn permissions(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let effective = self
            .effective_permissions(tenant, subject_kind, subject, as_of)
            .await?;
        Ok(effective.permissions.into_iter().collect())
    }

    /// Drops one subject's cache entry, or the whole tenant's when
    /// `subject` is `None`.
    pub async fn invalidate(
        &self,
        tenant: &TenantId,
        subject: Option<(SubjectKind, &SubjectId)>,
    ) {
        match subject {
            Some((kind, subject)) => {
                self.cache.invalidate_subject(tenant, kind, subject).await;
            }
            None => self.cache.invalidate_tenant(tenant).await,
        }
    }

    /// Creates a role and invalidates the scope it can affect.
    pub async fn create_role(
        &self,
        tenant: Option<TenantId>,
        draft: RoleDraft,
    ) -> Result<RoleDefinition> {
        let created = self.roles.create_role(tenant.clone(), draft).await?;
        // Forward references may already point at the new id.
        match &tenant {
            Some(tenant) => self.cache.invalidate_tenant(tenant).await,
            None => self.cache.invalidate_all().await,
        }
        Ok(created)
    }

    /// Updates a role and invalidates every entry it fed.
    pub async fn update_role(
        &self,
        tenant: Option<TenantId>,
        role: RoleId,
        update: RoleUpdate,
    ) -> Result<RoleDefinition> {
        let updated = self.roles.update_role(tenant.clone(), role, update).await?;
        match &tenant {
            Some(tenant) => self.cache.invalidate_role(tenant, &updated.id).await,
            None => self.cache.invalidate_all().await,
        }
        Ok(updated)
    }

    /// Deletes a role and invalidates every entry it fed.
    pub async fn delete_role(&self, tenant: Option<TenantId>, role: RoleId) -> Result<()> {
        self.roles.delete_role(tenant.clone(), role.clone()).await?;
        match &tenant {
            Some(tenant) => self.cache.invalidate_role(tenant, &role).await,
            None => self.cache.invalidate_all().await,
        }
        Ok(())
    }

    /// Assigns a role after checking it resolves within the tenant, then
    /// invalidates the subject's entry.
    pub async fn assign_role(
        &self,
        tenant: TenantId,
        role: RoleId,
        subject_kind: SubjectKind,
        subject: SubjectId,
        options: BindingOptions,
    ) -> Result<RoleBinding> {
        if self.roles.resolve_role(&tenant, &role).await?.is_none() {
            return Err(Error::RoleNotFound { role });
        }
        let binding = self
            .bindings
            .assign_role(
                tenant.clone(),
                role,
                subject_kind,
                subject.clone(),
                options,
            )
            .await?;
        self.cache
            .invalidate_subject(&tenant, subject_kind, &subject)
            .await;
        Ok(binding)
    }

    /// Revokes a role and invalidates the subject's entry.
    pub async fn revoke_role(
        &self,
        tenant: TenantId,
        role: RoleId,
        subject_kind: SubjectKind,
        subject: SubjectId,
    ) -> Result<bool> {
        let removed = self
            .bindings
            .revoke_role(tenant.clone(), role, subject_kind, subject.clone())
            .await?;
        if removed {
            self.cache
                .invalidate_subject(&tenant, subject_kind, &subject)
                .await;
        }
        Ok(removed)
    }
}
