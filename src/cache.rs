use crate::rbac::EffectivePermissions;
use crate::types::{RoleId, SubjectId, SubjectKind, TenantId};
use async_trait::async_trait;

/// Cache interface for computed effective permissions.
///
/// Entries are keyed by `(tenant, subject kind, subject)`. Writes are
/// idempotent overwrites of a value derived purely from current role
/// and binding state, so concurrent recomputation for the same key is
/// harmless.
#[async_trait]
pub trait PermissionCache: Send + Sync {
    /// Gets the cached entry for a subject.
    async fn get_permissions(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
    ) -> Option<EffectivePermissions>;

    /// Stores the entry for a subject.
    async fn set_permissions(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
        value: EffectivePermissions,
    );

    /// Invalidates one subject's entry.
    async fn invalidate_subject(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
    );

    /// Invalidates every entry whose computation involved the role.
    async fn invalidate_role(&self, tenant: &TenantId, role: &RoleId);

    /// Invalidates every entry for the tenant.
    async fn invalidate_tenant(&self, tenant: &TenantId);

    /// Invalidates everything; used when a global role changes.
    async fn invalidate_all(&self);
}

/// No-op cache implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl PermissionCache for NoCache {
    async fn get_permissions(
        &self,
        _tenant: &TenantId,
        _subject_kind: SubjectKind,
        _subject: &SubjectId,
    ) -> Option<EffectivePermissions> {
        None
    }

    async fn set_permissions(
        &self,
        _tenant: &TenantId,
        _subject_kind: SubjectKind,
        _subject: &SubjectId,
        _value: EffectivePermissions,
    ) {
    }

    async fn invalidate_subject(
        &self,
        _tenant: &TenantId,
        _subject_kind: SubjectKind,
        _subject: &SubjectId,
    ) {
    }

    async fn invalidate_role(&self, _tenant: &TenantId, _role: &RoleId) {}

    async fn invalidate_tenant(&self, _tenant: &TenantId) {}

    async fn invalidate_all(&self) {}
}
