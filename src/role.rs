use crate::error::{Error, Result};
use crate::permission::validate_pattern;
use crate::store::RbacStore;
use crate::types::{RoleId, TenantId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::info;

const MIN_ROLE_NAME_LEN: usize = 2;
const MAX_ROLE_NAME_LEN: usize = 50;

/// Lifecycle state of a role definition.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RoleStatus {
    #[default]
    Active,
    /// Disabled roles stay stored but contribute no permissions.
    Disabled,
}

/// A stored role: a named bundle of grant patterns, optionally
/// inheriting from other roles.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RoleDefinition {
    pub id: RoleId,
    /// `None` for global roles shared across tenants.
    pub tenant: Option<TenantId>,
    pub name: String,
    /// Grant patterns per the permission model.
    pub permissions: Vec<String>,
    /// Direct parent roles; the graph must stay acyclic.
    pub inherits: Vec<RoleId>,
    pub is_system: bool,
    pub status: RoleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`RoleManager::create_role`].
#[derive(Clone, Debug)]
pub struct RoleDraft {
    pub id: RoleId,
    pub name: String,
    pub permissions: Vec<String>,
    pub inherits: Vec<RoleId>,
}

impl RoleDraft {
    /// Starts a draft with no permissions or parents.
    pub fn new(id: RoleId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            permissions: Vec::new(),
            inherits: Vec::new(),
        }
    }

    /// Adds a grant pattern.
    pub fn permission(mut self, pattern: impl Into<String>) -> Self {
        self.permissions.push(pattern.into());
        self
    }

    /// Adds a parent role.
    pub fn inherit(mut self, role: RoleId) -> Self {
        self.inherits.push(role);
        self
    }
}

/// Partial update for [`RoleManager::update_role`]; unset fields keep
/// their stored value.
#[derive(Clone, Debug, Default)]
pub struct RoleUpdate {
    pub name: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub inherits: Option<Vec<RoleId>>,
    pub status: Option<RoleStatus>,
}

impl RoleUpdate {
    /// Starts an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Renames the role.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replaces the grant patterns.
    pub fn permissions<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Replaces the parent roles.
    pub fn inherits(mut self, roles: impl IntoIterator<Item = RoleId>) -> Self {
        self.inherits = Some(roles.into_iter().collect());
        self
    }

    /// Replaces the status.
    pub fn status(mut self, status: RoleStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Blueprint for a built-in system role.
#[derive(Clone, Debug)]
pub struct RoleTemplate {
    pub id: RoleId,
    pub name: String,
    pub permissions: Vec<String>,
}

impl RoleTemplate {
    /// Creates a template.
    pub fn new<I, S>(id: RoleId, name: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            name: name.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    /// The stock templates: `super_admin` (everything, everywhere),
    /// `tenant_admin` (everything within the binding tenant) and
    /// `viewer` (read-only).
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(
                RoleId::from_string("super_admin".to_string()),
                "super_admin",
                ["*"],
            ),
            Self::new(
                RoleId::from_string("tenant_admin".to_string()),
                "tenant_admin",
                ["*"],
            ),
            Self::new(
                RoleId::from_string("viewer".to_string()),
                "viewer",
                ["*:read", "*:list"],
            ),
        ]
    }

    fn materialize(&self, at: DateTime<Utc>) -> RoleDefinition {
        RoleDefinition {
            id: self.id.clone(),
            tenant: None,
            name: self.name.clone(),
            permissions: self.permissions.clone(),
            inherits: Vec::new(),
            is_system: true,
            status: RoleStatus::Active,
            created_at: at,
            updated_at: at,
        }
    }
}

/// Role CRUD over an [`RbacStore`], with name validation, per-scope
/// uniqueness, system-role protection and inheritance cycle checks.
///
/// Built-in templates are held in memory as global system roles; they
/// resolve like stored roles but are never written to the store.
pub struct RoleManager<S> {
    store: Arc<S>,
    builtins: HashMap<RoleId, RoleDefinition>,
}

impl<S> RoleManager<S>
where
    S: RbacStore,
{
    /// Creates a manager with the default templates installed.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_templates(store, RoleTemplate::defaults())
    }

    /// Creates a manager with a custom template set; pass an empty list
    /// to disable built-ins entirely.
    pub fn with_templates(store: Arc<S>, templates: Vec<RoleTemplate>) -> Self {
        let now = Utc::now();
        let builtins = templates
            .into_iter()
            .map(|template| (template.id.clone(), template.materialize(now)))
            .collect();
        Self { store, builtins }
    }

    /// Creates a role in the given scope.
    pub async fn create_role(
        &self,
        tenant: Option<TenantId>,
        draft: RoleDraft,
    ) -> Result<RoleDefinition> {
        validate_role_name(&draft.name)?;
        for pattern in &draft.permissions {
            validate_pattern(pattern)?;
        }
        if self.get_role(tenant.clone(), draft.id.clone()).await?.is_some() {
            return Err(Error::DuplicateRole { role: draft.id });
        }
        if self.name_taken(tenant.as_ref(), &draft.name, None).await? {
            return Err(Error::DuplicateRoleName { name: draft.name });
        }
        self.ensure_acyclic(tenant.as_ref(), &draft.id, &draft.inherits)
            .await?;

        let now = Utc::now();
        let role = RoleDefinition {
            id: draft.id,
            tenant,
            name: draft.name,
            permissions: draft.permissions,
            inherits: draft.inherits,
            is_system: false,
            status: RoleStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.store.save_role(role.clone()).await?;
        info!(role = %role.id, tenant = ?role.tenant, "role created");
        Ok(role)
    }

    /// Applies a partial update to a non-system role.
    pub async fn update_role(
        &self,
        tenant: Option<TenantId>,
        role: RoleId,
        update: RoleUpdate,
    ) -> Result<RoleDefinition> {
        let mut existing = self.require_mutable(tenant.clone(), role).await?;

        if let Some(name) = update.name {
            validate_role_name(&name)?;
            if name != existing.name
                && self
                    .name_taken(tenant.as_ref(), &name, Some(&existing.id))
                    .await?
            {
                return Err(Error::DuplicateRoleName { name });
            }
            existing.name = name;
        }
        if let Some(permissions) = update.permissions {
            for pattern in &permissions {
                validate_pattern(pattern)?;
            }
            existing.permissions = permissions;
        }
        if let Some(inherits) = update.inherits {
            self.ensure_acyclic(tenant.as_ref(), &existing.id, &inherits)
                .await?;
            existing.inherits = inherits;
        }
        if let Some(status) = update.status {
            existing.status = status;
        }

        existing.updated_at = Utc::now();
        self.store.save_role(existing.clone()).await?;
        info!(role = %existing.id, tenant = ?existing.tenant, "role updated");
        Ok(existing)
    }

    /// Deletes a non-system role.
    pub async fn delete_role(&self, tenant: Option<TenantId>, role: RoleId) -> Result<()> {
        let existing = self.require_mutable(tenant.clone(), role).await?;
        self.store
            .delete_role(tenant, existing.id.clone())
            .await?;
        info!(role = %existing.id, tenant = ?existing.tenant, "role deleted");
        Ok(())
    }

    /// Returns a role from exactly the given scope; global lookups see
    /// the built-in templates.
    pub async fn get_role(
        &self,
        tenant: Option<TenantId>,
        role: RoleId,
    ) -> Result<Option<RoleDefinition>> {
        if tenant.is_none()
            && let Some(builtin) = self.builtins.get(&role)
        {
            return Ok(Some(builtin.clone()));
        }
        Ok(self.store.get_role(tenant, role).await?)
    }

    /// Resolves a role id as seen from a tenant: the tenant's own scope
    /// first, then global roles and built-ins.
    pub async fn resolve_role(
        &self,
        tenant: &TenantId,
        role: &RoleId,
    ) -> Result<Option<RoleDefinition>> {
        if let Some(found) = self
            .store
            .get_role(Some(tenant.clone()), role.clone())
            .await?
        {
            return Ok(Some(found));
        }
        self.get_role(None, role.clone()).await
    }

    /// Lists all roles in the given scope.
    pub async fn list_roles(&self, tenant: Option<TenantId>) -> Result<Vec<RoleDefinition>> {
        let mut roles: Vec<RoleDefinition> = if tenant.is_none() {
            self.builtins.values().cloned().collect()
        } else {
            Vec::new()
        };
        roles.extend(self.store.list_roles(tenant).await?);
        Ok(roles)
    }

    async fn require_mutable(
        &self,
        tenant: Option<TenantId>,
        role: RoleId,
    ) -> Result<RoleDefinition> {
        if self.builtins.contains_key(&role) && tenant.is_none() {
            return Err(Error::SystemRoleImmutable { role });
        }
        let Some(existing) = self.store.get_role(tenant, role.clone()).await? else {
            return Err(Error::RoleNotFound { role });
        };
        if existing.is_system {
            return Err(Error::SystemRoleImmutable { role });
        }
        Ok(existing)
    }

    async fn name_taken(
        &self,
        tenant: Option<&TenantId>,
        name: &str,
        exclude: Option<&RoleId>,
    ) -> Result<bool> {
        let roles = self.list_roles(tenant.cloned()).await?;
        Ok(roles
            .iter()
            .filter(|role| exclude.is_none_or(|id| role.id.as_str() != id.as_str()))
            .any(|role| role.name == name))
    }

    /// Walks the proposed parent edges plus every stored edge reachable
    /// from them; revisiting the origin means the update would close a
    /// cycle. Unknown parents contribute no edges, so forward
    /// references stay allowed.
    async fn ensure_acyclic(
        &self,
        tenant: Option<&TenantId>,
        origin: &RoleId,
        proposed: &[RoleId],
    ) -> Result<()> {
        let mut queue: VecDeque<RoleId> = proposed.iter().cloned().collect();
        let mut visited: HashSet<RoleId> = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current.as_str() == origin.as_str() {
                return Err(Error::RoleCycleDetected {
                    role: origin.clone(),
                });
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            let found = match tenant {
                Some(tenant) => self.resolve_role(tenant, &current).await?,
                None => self.get_role(None, current).await?,
            };
            if let Some(definition) = found {
                queue.extend(definition.inherits);
            }
        }
        Ok(())
    }
}

fn validate_role_name(name: &str) -> Result<()> {
    if name.len() < MIN_ROLE_NAME_LEN || name.len() > MAX_ROLE_NAME_LEN {
        return Err(Error::InvalidRoleName(format!(
            "name length must be {MIN_ROLE_NAME_LEN}..={MAX_ROLE_NAME_LEN}, got {}",
            name.len()
        )));
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => {
            return Err(Error::InvalidRoleName(
                "name must start with a letter".to_string(),
            ));
        }
    }
    if !chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-')) {
        return Err(Error::InvalidRoleName(format!(
            "name contains invalid characters: {name:?}"
        )));
    }
    Ok(())
}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use futures::executor::block_on;

    fn manager() -> RoleManager<MemoryStore> {
        RoleManager::new(Arc::new(MemoryStore::new()))
    }

    fn tenant() -> TenantId {
        TenantId::try_from("t1").unwrap()
    }

    fn role_id(value: &str) -> RoleId {
        RoleId::try_from(value).unwrap()
    }

    #[test]
    fn create_and_get_round_trip() {
        let manager = manager();
        let created = block_on(manager.create_role(
            Some(tenant()),
            RoleDraft::new(role_id("editor"), "editor")
                .permission("content:read")
                .permission("content:write"),
        ))
        .unwrap();
        assert!(!created.is_system);
        assert_eq!(created.status, RoleStatus::Active);

        let fetched = block_on(manager.get_role(Some(tenant()), role_id("editor")))
            .unwrap()
            .unwrap();
        assert_eq!(fetched.permissions, vec!["content:read", "content:write"]);
    }

    #[test]
    fn create_rejects_duplicates_in_scope() {
        let manager = manager();
        block_on(manager.create_role(
            Some(tenant()),
            RoleDraft::new(role_id("editor"), "editor"),
        ))
        .unwrap();
        assert!(matches!(
            block_on(manager.create_role(
                Some(tenant()),
                RoleDraft::new(role_id("editor"), "editor-two"),
            )),
            Err(Error::DuplicateRole { .. })
        ));
        assert!(matches!(
            block_on(manager.create_role(
                Some(tenant()),
                RoleDraft::new(role_id("editor2"), "editor"),
            )),
            Err(Error::DuplicateRoleName { .. })
        ));
        // Same name in another tenant is fine.
        assert!(
            block_on(manager.create_role(
                Some(TenantId::try_from("t2").unwrap()),
                RoleDraft::new(role_id("editor"), "editor"),
            ))
            .is_ok()
        );
    }

    #[test]
    fn create_validates_names_and_patterns() {
        let manager = manager();
        for bad in ["x", "1role", "has space", &"r".repeat(51)] {
            assert!(matches!(
                block_on(manager.create_role(Some(tenant()), RoleDraft::new(role_id("r1"), bad))),
                Err(Error::InvalidRoleName(_))
            ));
        }
        assert!(matches!(
            block_on(manager.create_role(
                Some(tenant()),
                RoleDraft::new(role_id("r1"), "reader").permission("not-a-pattern"),
            )),
            Err(Error::InvalidPermission(_))
        ));
    }

    #[test]
    fn inheritance_cycle_is_rejected() {
        let manager = manager();
        block_on(manager.create_role(
            Some(tenant()),
            RoleDraft::new(role_id("a"), "role-a"),
        ))
        .unwrap();
        block_on(manager.create_role(
            Some(tenant()),
            RoleDraft::new(role_id("b"), "role-b").inherit(role_id("a")),
        ))
        .unwrap();
        block_on(manager.create_role(
            Some(tenant()),
            RoleDraft::new(role_id("c"), "role-c").inherit(role_id("b")),
        ))
        .unwrap();

        let err = block_on(manager.update_role(
            Some(tenant()),
            role_id("a"),
            RoleUpdate::new().inherits([role_id("c")]),
        ))
        .expect_err("cycle must be rejected");
        assert!(matches!(err, Error::RoleCycleDetected { .. }));

        // Self-inheritance is the smallest cycle.
        assert!(matches!(
            block_on(manager.create_role(
                Some(tenant()),
                RoleDraft::new(role_id("d"), "role-d").inherit(role_id("d")),
            )),
            Err(Error::RoleCycleDetected { .. })
        ));
    }

    #[test]
    fn builtin_templates_are_immutable_globals() {
        let manager = manager();
        let viewer = block_on(manager.get_role(None, role_id("viewer")))
            .unwrap()
            .unwrap();
        assert!(viewer.is_system);
        assert_eq!(viewer.permissions, vec!["*:read", "*:list"]);

        assert!(matches!(
            block_on(manager.update_role(
                None,
                role_id("viewer"),
                RoleUpdate::new().permissions(["*"]),
            )),
            Err(Error::SystemRoleImmutable { .. })
        ));
        assert!(matches!(
            block_on(manager.delete_role(None, role_id("super_admin"))),
            Err(Error::SystemRoleImmutable { .. })
        ));
    }

    #[test]
    fn templates_can_be_overridden() {
        let store = Arc::new(MemoryStore::new());
        let manager = RoleManager::with_templates(store, Vec::new());
        assert!(block_on(manager.get_role(None, role_id("viewer")))
            .unwrap()
            .is_none());
    }

    #[test]
    fn resolve_role_prefers_tenant_scope() {
        let manager = manager();
        block_on(manager.create_role(
            None,
            RoleDraft::new(role_id("auditor"), "auditor").permission("audit:read"),
        ))
        .unwrap();
        block_on(manager.create_role(
            Some(tenant()),
            RoleDraft::new(role_id("auditor2"), "auditor2").permission("audit:export"),
        ))
        .unwrap();

        let global = block_on(manager.resolve_role(&tenant(), &role_id("auditor")))
            .unwrap()
            .unwrap();
        assert!(global.tenant.is_none());
        let tenant_scoped = block_on(manager.resolve_role(&tenant(), &role_id("auditor2")))
            .unwrap()
            .unwrap();
        assert_eq!(tenant_scoped.tenant, Some(tenant()));
    }

    #[test]
    fn update_missing_role_fails() {
        let manager = manager();
        assert!(matches!(
            block_on(manager.update_role(Some(tenant()), role_id("ghost"), RoleUpdate::new())),
            Err(Error::RoleNotFound { .. })
        ));
    }
}
