use crate::binding::RoleBinding;
use crate::error::StoreError;
use crate::role::RoleDefinition;
use crate::types::{RoleId, SubjectId, SubjectKind, TenantId};
use async_trait::async_trait;

/// Store interface for role definitions.
///
/// Roles are keyed by `(tenant, id)`; a `None` tenant addresses global
/// roles. Stores persist raw definitions and perform no validation:
/// name rules, cycle checks and system-role protection all live in the
/// role manager.
#[async_trait]
pub trait RoleStore {
    /// Returns a role definition, if present.
    async fn get_role(
        &self,
        tenant: Option<TenantId>,
        role: RoleId,
    ) -> std::result::Result<Option<RoleDefinition>, StoreError>;

    /// Returns every role definition in the scope.
    async fn list_roles(
        &self,
        tenant: Option<TenantId>,
    ) -> std::result::Result<Vec<RoleDefinition>, StoreError>;

    /// Creates or replaces a role definition.
    async fn save_role(&self, role: RoleDefinition) -> std::result::Result<(), StoreError>;

    /// Deletes a role definition, returning whether it existed.
    async fn delete_role(
        &self,
        tenant: Option<TenantId>,
        role: RoleId,
    ) -> std::result::Result<bool, StoreError>;
}

/// Store interface for role bindings.
///
/// Expired bindings are returned as-is; filtering by expiry happens in
/// the binding manager against the evaluation timestamp.
#[async_trait]
pub trait BindingStore {
    /// Returns a binding by its id, if present.
    async fn get_binding(
        &self,
        tenant: TenantId,
        id: String,
    ) -> std::result::Result<Option<RoleBinding>, StoreError>;

    /// Persists a new binding. Duplicates are allowed.
    async fn save_binding(&self, binding: RoleBinding) -> std::result::Result<(), StoreError>;

    /// Deletes every binding of `role` to the subject, returning whether
    /// any existed.
    async fn delete_bindings(
        &self,
        tenant: TenantId,
        role: RoleId,
        subject_kind: SubjectKind,
        subject: SubjectId,
    ) -> std::result::Result<bool, StoreError>;

    /// Returns every binding held by the subject, including expired ones.
    async fn subject_bindings(
        &self,
        tenant: TenantId,
        subject_kind: SubjectKind,
        subject: SubjectId,
    ) -> std::result::Result<Vec<RoleBinding>, StoreError>;
}

/// Composite store trait.
pub trait RbacStore: RoleStore + BindingStore + Send + Sync {}

impl<T> RbacStore for T where T: RoleStore + BindingStore + Send + Sync {}
