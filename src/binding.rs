use crate::error::Result;
use crate::store::RbacStore;
use crate::types::{RoleId, SubjectId, SubjectKind, TenantId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Assignment of a role to a subject within a tenant.
///
/// A binding past its `expires_at` is treated as absent at query time
/// but is not physically deleted.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RoleBinding {
    pub id: String,
    pub tenant: TenantId,
    pub role: RoleId,
    pub subject_kind: SubjectKind,
    pub subject: SubjectId,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<SubjectId>,
}

impl RoleBinding {
    /// Returns whether the binding is active at the given instant.
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires| expires > at)
    }
}

/// Optional fields for [`BindingManager::assign_role`].
#[derive(Clone, Debug, Default)]
pub struct BindingOptions {
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: Option<SubjectId>,
}

impl BindingOptions {
    /// Starts with no expiry and no creator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the expiry instant.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Records who created the binding.
    pub fn created_by(mut self, subject: SubjectId) -> Self {
        self.created_by = Some(subject);
        self
    }
}

/// Binding CRUD over an [`RbacStore`].
///
/// Queries take an explicit `as_of` instant so expiry is judged against
/// the evaluation timestamp carried in the request context, never the
/// wall clock.
pub struct BindingManager<S> {
    store: Arc<S>,
}

impl<S> BindingManager<S>
where
    S: RbacStore,
{
    /// Creates a manager.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persists a new binding. A subject may hold any number of
    /// simultaneous bindings, including duplicates of the same role.
    pub async fn assign_role(
        &self,
        tenant: TenantId,
        role: RoleId,
        subject_kind: SubjectKind,
        subject: SubjectId,
        options: BindingOptions,
    ) -> Result<RoleBinding> {
        let binding = RoleBinding {
            id: Uuid::new_v4().to_string(),
            tenant,
            role,
            subject_kind,
            subject,
            expires_at: options.expires_at,
            created_at: Utc::now(),
            created_by: options.created_by,
        };
        self.store.save_binding(binding.clone()).await?;
        info!(
            tenant = %binding.tenant,
            role = %binding.role,
            subject = %binding.subject,
            "role assigned"
        );
        Ok(binding)
    }

    /// Removes every binding of `role` to the subject, returning whether
    /// any existed.
    pub async fn revoke_role(
        &self,
        tenant: TenantId,
        role: RoleId,
        subject_kind: SubjectKind,
        subject: SubjectId,
    ) -> Result<bool> {
        let removed = self
            .store
            .delete_bindings(tenant.clone(), role.clone(), subject_kind, subject.clone())
            .await?;
        if removed {
            info!(%tenant, %role, %subject, "role revoked");
        }
        Ok(removed)
    }

    /// Returns the subject's bindings active at `as_of`.
    pub async fn subject_roles(
        &self,
        tenant: TenantId,
        subject_kind: SubjectKind,
        subject: SubjectId,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<RoleBinding>> {
        let bindings = self
            .store
            .subject_bindings(tenant, subject_kind, subject)
            .await?;
        Ok(bindings
            .into_iter()
            .filter(|binding| binding.is_active(as_of))
            .collect())
    }

    /// Returns whether the subject holds `role` at `as_of`.
    pub async fn has_role(
        &self,
        tenant: TenantId,
        role: RoleId,
        subject_kind: SubjectKind,
        subject: SubjectId,
        as_of: DateTime<Utc>,
    ) -> Result<bool> {
        let bindings = self
            .subject_roles(tenant, subject_kind, subject, as_of)
            .await?;
        Ok(bindings
            .iter()
            .any(|binding| binding.role.as_str() == role.as_str()))
    }
}
