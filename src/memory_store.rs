use crate::binding::RoleBinding;
use crate::role::RoleDefinition;
use crate::store::{BindingStore, RoleStore};
use crate::types::{RoleId, SubjectId, SubjectKind, TenantId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory store implementation for tests and demos.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    roles: RwLock<HashMap<(Option<TenantId>, RoleId), RoleDefinition>>,
    bindings: RwLock<Vec<RoleBinding>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn get_role(
        &self,
        tenant: Option<TenantId>,
        role: RoleId,
    ) -> std::result::Result<Option<RoleDefinition>, crate::StoreError> {
        let guard = self.inner.roles.read().expect("poisoned lock");
        Ok(guard.get(&(tenant, role)).cloned())
    }

    async fn list_roles(
        &self,
        tenant: Option<TenantId>,
    ) -> std::result::Result<Vec<RoleDefinition>, crate::StoreError> {
        let guard = self.inner.roles.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .filter(|((scope, _), _)| *scope == tenant)
            .map(|(_, role)| role.clone())
            .collect())
    }

    async fn save_role(
        &self,
        role: RoleDefinition,
    ) -> std::result::Result<(), crate::StoreError> {
        let mut guard = self.inner.roles.write().expect("poisoned lock");
        guard.insert((role.tenant.clone(), role.id.clone()), role);
        Ok(())
    }

    async fn delete_role(
        &self,
        tenant: Option<TenantId>,
        role: RoleId,
    ) -> std::result::Result<bool, crate::StoreError> {
        let mut guard = self.inner.roles.write().expect("poisoned lock");
        Ok(guard.remove(&(tenant, role)).is_some())
    }
}

#[async_trait]
impl BindingStore for MemoryStore {
    async fn get_binding(
        &self,
        tenant: TenantId,
        id: String,
    ) -> std::result::Result<Option<RoleBinding>, crate::StoreError> {
        let guard = self.inner.bindings.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .find(|binding| binding.tenant == tenant && binding.id == id)
            .cloned())
    }

    async fn save_binding(
        &self,
        binding: RoleBinding,
    ) -> std::result::Result<(), crate::StoreError> {
        let mut guard = self.inner.bindings.write().expect("poisoned lock");
        guard.push(binding);
        Ok(())
    }

    async fn delete_bindings(
        &self,
        tenant: TenantId,
        role: RoleId,
        subject_kind: SubjectKind,
        subject: SubjectId,
    ) -> std::result::Result<bool, crate::StoreError> {
        let mut guard = self.inner.bindings.write().expect("poisoned lock");
        let before = guard.len();
        guard.retain(|binding| {
            !(binding.tenant == tenant
                && binding.role == role
                && binding.subject_kind == subject_kind
                && binding.subject == subject)
        });
        Ok(guard.len() != before)
    }

    async fn subject_bindings(
        &self,
        tenant: TenantId,
        subject_kind: SubjectKind,
        subject: SubjectId,
    ) -> std::result::Result<Vec<RoleBinding>, crate::StoreError> {
        let guard = self.inner.bindings.read().expect("poisoned lock");
        Ok(guard
            .iter()
            .filter(|binding| {
                binding.tenant == tenant
                    && binding.subject_kind == subject_kind
                    && binding.subject == subject
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::RoleStatus;
    use chrono::Utc;
    use futures::executor::block_on;

    fn definition(tenant: Option<TenantId>, id: &str) -> RoleDefinition {
        let now = Utc::now();
        RoleDefinition {
            id: RoleId::try_from(id).unwrap(),
            tenant,
            name: id.to_string(),
            permissions: vec!["invoice:read".to_string()],
            inherits: Vec::new(),
            is_system: false,
            status: RoleStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn role_scopes_are_isolated() {
        let store = MemoryStore::new();
        let tenant = TenantId::try_from("t1").unwrap();
        block_on(store.save_role(definition(Some(tenant.clone()), "editor"))).unwrap();
        block_on(store.save_role(definition(None, "auditor"))).unwrap();

        let in_tenant = block_on(store.list_roles(Some(tenant.clone()))).unwrap();
        assert_eq!(in_tenant.len(), 1);
        assert_eq!(in_tenant[0].id.as_str(), "editor");

        let global = block_on(store.list_roles(None)).unwrap();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].id.as_str(), "auditor");

        assert!(
            block_on(store.get_role(Some(tenant.clone()), RoleId::try_from("auditor").unwrap()))
                .unwrap()
                .is_none()
        );
        assert!(
            block_on(store.delete_role(Some(tenant), RoleId::try_from("editor").unwrap()))
                .unwrap()
        );
    }

    #[test]
    fn delete_bindings_matches_the_full_key() {
        let store = MemoryStore::new();
        let tenant = TenantId::try_from("t1").unwrap();
        let role = RoleId::try_from("editor").unwrap();
        let subject = SubjectId::try_from("u1").unwrap();
        let binding = RoleBinding {
            id: "b1".to_string(),
            tenant: tenant.clone(),
            role: role.clone(),
            subject_kind: SubjectKind::User,
            subject: subject.clone(),
            expires_at: None,
            created_at: Utc::now(),
            created_by: None,
        };
        block_on(store.save_binding(binding.clone())).unwrap();
        block_on(store.save_binding(RoleBinding {
            id: "b2".to_string(),
            subject_kind: SubjectKind::Service,
            ..binding
        }))
        .unwrap();

        // Only the user-kind binding goes away.
        assert!(block_on(store.delete_bindings(
            tenant.clone(),
            role,
            SubjectKind::User,
            subject.clone()
        ))
        .unwrap());
        let left =
            block_on(store.subject_bindings(tenant.clone(), SubjectKind::Service, subject))
                .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "b2");

        assert!(block_on(store.get_binding(tenant.clone(), "b1".to_string()))
            .unwrap()
            .is_none());
        assert!(block_on(store.get_binding(tenant, "b2".to_string()))
            .unwrap()
            .is_some());
    }
}
