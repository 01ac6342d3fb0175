use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cache::PermissionCache;
use crate::rbac::EffectivePermissions;
use crate::types::{RoleId, SubjectId, SubjectKind, TenantId};

/// In-memory cache for effective permissions.
///
/// This is a simple LRU cache with optional TTL. It is intended for
/// tests and small deployments where a process-local cache is
/// sufficient.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    inner: Arc<Mutex<CacheState>>,
    capacity: usize,
    ttl: Option<Duration>,
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    order: VecDeque<CacheKey>,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CacheKey {
    tenant: TenantId,
    subject_kind: SubjectKind,
    subject: SubjectId,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: EffectivePermissions,
    updated_at: Instant,
}

impl MemoryCache {
    /// Creates a new cache with the given capacity.
    ///
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            })),
            capacity,
            ttl: None,
        }
    }

    /// Configures a time-to-live for cache entries.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn key(tenant: &TenantId, subject_kind: SubjectKind, subject: &SubjectId) -> CacheKey {
        CacheKey {
            tenant: tenant.clone(),
            subject_kind,
            subject: subject.clone(),
        }
    }

    fn remove_key(state: &mut CacheState, key: &CacheKey) {
        if state.entries.remove(key).is_some() {
            state.order.retain(|existing| existing != key);
        }
    }

    fn touch(state: &mut CacheState, key: &CacheKey) {
        state.order.retain(|existing| existing != key);
        state.order.push_back(key.clone());
    }

    fn is_expired(entry: &CacheEntry, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(entry.updated_at) > ttl
    }

    fn prune_expired(state: &mut CacheState, ttl: Duration, now: Instant) {
        state
            .entries
            .retain(|_, entry| !Self::is_expired(entry, ttl, now));
        state.order.retain(|key| state.entries.contains_key(key));
    }

    fn evict_if_needed(state: &mut CacheState, capacity: usize) {
        if capacity == 0 {
            state.entries.clear();
            state.order.clear();
            return;
        }

        while state.entries.len() > capacity {
            if let Some(key) = state.order.pop_front() {
                state.entries.remove(&key);
            } else {
                break;
            }
        }
    }

    fn remove_matching<F>(state: &mut CacheState, predicate: F)
    where
        F: Fn(&CacheKey, &CacheEntry) -> bool,
    {
        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            Self::remove_key(state, &key);
        }
    }
}

#[async_trait]
impl PermissionCache for MemoryCache {
    async fn get_permissions(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
    ) -> Option<EffectivePermissions> {
        if self.capacity == 0 {
            return None;
        }

        let key = Self::key(tenant, subject_kind, subject);
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");

        if let Some(ttl) = self.ttl
            && let Some(entry) = guard.entries.get(&key)
            && Self::is_expired(entry, ttl, now)
        {
            Self::remove_key(&mut guard, &key);
            return None;
        }

        let value = guard.entries.get(&key).map(|entry| entry.value.clone());
        if value.is_some() {
            Self::touch(&mut guard, &key);
        }
        value
    }

    async fn set_permissions(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
        value: EffectivePermissions,
    ) {
        if self.capacity == 0 {
            return;
        }

        let key = Self::key(tenant, subject_kind, subject);
        let now = Instant::now();
        let mut guard = self.inner.lock().expect("poisoned lock");

        if let Some(ttl) = self.ttl {
            Self::prune_expired(&mut guard, ttl, now);
        }

        guard.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                updated_at: now,
            },
        );
        Self::touch(&mut guard, &key);
        Self::evict_if_needed(&mut guard, self.capacity);
    }

    async fn invalidate_subject(
        &self,
        tenant: &TenantId,
        subject_kind: SubjectKind,
        subject: &SubjectId,
    ) {
        let key = Self::key(tenant, subject_kind, subject);
        let mut guard = self.inner.lock().expect("poisoned lock");
        Self::remove_key(&mut guard, &key);
    }

    async fn invalidate_role(&self, tenant: &TenantId, role: &RoleId) {
        // Entries record the roles that fed them, so only touched
        // subjects are dropped.
        let mut guard = self.inner.lock().expect("poisoned lock");
        Self::remove_matching(&mut guard, |key, entry| {
            &key.tenant == tenant && entry.value.roles.contains(role)
        });
    }

    async fn invalidate_tenant(&self, tenant: &TenantId) {
        let mut guard = self.inner.lock().expect("poisoned lock");
        Self::remove_matching(&mut guard, |key, _| &key.tenant == tenant);
    }

    async fn invalidate_all(&self) {
        let mut guard = self.inner.lock().expect("poisoned lock");
        guard.entries.clear();
        guard.order.clear();
    }
}
