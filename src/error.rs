use crate::types::{PolicyId, ResourceName, RoleId};
use thiserror::Error;

/// Store-layer error type.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Crate result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
///
/// These surface only on the configuration path (defining roles and
/// policies, registering plugins, wiring the gate). Permission checks
/// themselves never fail: evaluation errors degrade to a deny and the
/// reason is carried in the decision instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Store error wrapper.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// Invalid identifier input.
    #[error("invalid id: {0}")]
    InvalidId(String),
    /// Invalid permission code or pattern.
    #[error("invalid permission: {0}")]
    InvalidPermission(String),
    /// Invalid role name input.
    #[error("invalid role name: {0}")]
    InvalidRoleName(String),
    /// Role lookup failed.
    #[error("role not found: {role}")]
    RoleNotFound { role: RoleId },
    /// Role id already present in the scope.
    #[error("duplicate role: {role}")]
    DuplicateRole { role: RoleId },
    /// Role name already taken within the tenant.
    #[error("duplicate role name: {name}")]
    DuplicateRoleName { name: String },
    /// Attempted to modify or delete a system role.
    #[error("system role is immutable: {role}")]
    SystemRoleImmutable { role: RoleId },
    /// Role inheritance cycle detected.
    #[error("role cycle detected at role {role}")]
    RoleCycleDetected { role: RoleId },
    /// Role inheritance depth exceeded.
    #[error("role inheritance depth exceeded at role {role}; max depth {max_depth}")]
    RoleDepthExceeded { role: RoleId, max_depth: usize },
    /// Policy id already registered.
    #[error("duplicate policy: {policy}")]
    DuplicatePolicy { policy: PolicyId },
    /// Policy lookup failed.
    #[error("policy not found: {policy}")]
    PolicyNotFound { policy: PolicyId },
    /// Resource name already registered.
    #[error("duplicate resource: {resource}")]
    DuplicateResource { resource: ResourceName },
    /// Resource lookup failed.
    #[error("resource not found: {resource}")]
    ResourceNotFound { resource: ResourceName },
    /// Registration attempted after the gate was initialized.
    #[error("registry is frozen: {operation} is only allowed before init")]
    RegistryFrozen { operation: &'static str },
    /// Plugin name already registered.
    #[error("duplicate plugin: {plugin}")]
    DuplicatePlugin { plugin: String },
    /// Plugin lookup failed.
    #[error("plugin not found: {plugin}")]
    PluginNotFound { plugin: String },
    /// Plugin declares a dependency that is not registered.
    #[error("plugin {plugin} depends on unregistered plugin {dependency}")]
    PluginDependencyMissing { plugin: String, dependency: String },
    /// Plugin cannot be uninstalled while another installed plugin needs it.
    #[error("plugin {plugin} is required by installed plugin {dependent}")]
    PluginRequired { plugin: String, dependent: String },
    /// Plugin lifecycle callback failed.
    #[error("plugin {plugin} failed: {source}")]
    PluginFailed {
        plugin: String,
        #[source]
        source: StoreError,
    },
    /// Global hook failed on the before or after phase.
    #[error("hook {hook} failed: {source}")]
    HookFailed {
        hook: String,
        #[source]
        source: StoreError,
    },
    /// Raised by `require_permission` when the check denies.
    #[error("permission denied for {code}: {reason}")]
    PermissionDenied { code: String, reason: String },
}

impl From<StoreError> for Error {
    fn from(error: StoreError) -> Self {
        Self::Store(error)
    }
}
