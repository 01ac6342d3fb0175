//! Multi-tenant authorization core.
//!
//! This crate layers three cooperating pieces: a permission model with
//! wildcard grant patterns and conditions, a deterministic allow/deny
//! policy engine, and a store-backed RBAC evaluator with role
//! inheritance, expiring bindings and an effective-permission cache.
//! The [`Gate`] orchestrates them behind one `check_permission` call,
//! with global hooks and installable plugins around it. The default
//! behavior everywhere is deny.
//!
//! # Examples
//!
//! Policy-driven checks need no store at all:
//! ```no_run
//! use tenant_gate::{
//!     Gate, PolicyDefinition, PolicyId, PolicyRule, Subject, SubjectId, TenantId, TenantRef,
//! };
//! let gate = Gate::new();
//! gate.register_policy(
//!     PolicyDefinition::new(PolicyId::new("docs").unwrap())
//!         .rule(PolicyRule::allow(["doc:read", "doc:list"])),
//! )
//! .unwrap();
//! let ctx = gate
//!     .create_context(TenantRef::new(TenantId::new("acme").unwrap()))
//!     .subject(Subject::user(SubjectId::new("u_1").unwrap()))
//!     .permission("doc:read")
//!     .build();
//! let _ = gate.check_permission(&ctx);
//! ```
//!
//! Role-backed resolution over the in-memory store (enable
//! `memory-store`):
//! ```no_run
//! # #[cfg(feature = "memory-store")]
//! # {
//! use std::sync::Arc;
//! use tenant_gate::{Gate, MemoryStore, RbacEvaluatorBuilder, RbacResolver};
//! let evaluator = Arc::new(RbacEvaluatorBuilder::new(MemoryStore::new()).build());
//! let gate = Gate::builder()
//!     .resolver(RbacResolver::new(evaluator))
//!     .build();
//! # let _ = gate;
//! # }
//! ```
#![forbid(unsafe_code)]

mod binding;
mod cache;
mod condition;
mod context;
mod error;
mod gate;
mod hooks;
mod permission;
mod plugin;
mod policy;
mod rbac;
mod role;
mod store;
mod types;
#[cfg(feature = "memory-cache")]
mod memory_cache;

#[cfg(feature = "memory-store")]
mod memory_store;

pub use crate::binding::{BindingManager, BindingOptions, RoleBinding};
pub use crate::cache::{NoCache, PermissionCache};
pub use crate::condition::{
    Condition, CustomCondition, FieldCondition, FieldOp, FnPredicate, IpCondition, IpMode,
    Predicate, TimeCondition,
};
pub use crate::context::{
    ContextBuilder, EvaluationContext, RequestInfo, Subject, TenantRef, TenantStatus,
};
pub use crate::error::{Error, Result, StoreError};
pub use crate::gate::{
    CHECK_OPERATION, CheckResult, CheckStrategy, DecisionSource, Gate, GateBuilder,
    PermissionResolver, PluginContext, PolicyProvider, RbacResolver, ResourceDefinition,
    SubscriptionId,
};
pub use crate::hooks::{GlobalHook, GlobalHookManager, HaltedBy, HookDecision};
pub use crate::permission::{Permission, Scope, code_matches, validate_code, validate_pattern};
pub use crate::plugin::{Plugin, PluginManager, PluginStatus};
pub use crate::policy::{
    CompiledPolicy, Effect, PolicyDefinition, PolicyEvaluation, PolicyMatch, PolicyRule,
    PolicySet, RulePriority,
};
pub use crate::rbac::{EffectivePermissions, RbacCheckResult, RbacEvaluator, RbacEvaluatorBuilder};
pub use crate::role::{RoleDefinition, RoleDraft, RoleManager, RoleStatus, RoleTemplate, RoleUpdate};
pub use crate::store::{BindingStore, RbacStore, RoleStore};
pub use crate::types::{PolicyId, ResourceName, RoleId, SubjectId, SubjectKind, TenantId};

#[cfg(feature = "memory-store")]
pub use crate::memory_store::MemoryStore;

#[cfg(feature = "memory-cache")]
pub use crate::memory_cache::MemoryCache;
