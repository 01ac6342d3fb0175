use crate::context::EvaluationContext;
use crate::error::{Error, Result, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Verdict returned by [`GlobalHook::before`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HookDecision {
    /// Let the operation continue.
    Proceed,
    /// Stop the operation before it runs.
    Halt { reason: String },
}

impl HookDecision {
    /// Shorthand for a halt verdict.
    pub fn halt(reason: impl Into<String>) -> Self {
        Self::Halt {
            reason: reason.into(),
        }
    }

    pub fn is_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// Identifies the hook that stopped an operation in
/// [`GlobalHookManager::run_before`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HaltedBy {
    pub hook: String,
    pub reason: String,
}

/// Callbacks invoked around every gated operation, permission checks
/// included. Intended for auditing, metrics and rate limiting.
///
/// Failure handling is deliberately asymmetric: `before` and `after`
/// errors propagate to the caller because they can block or taint an
/// operation, while `on_error` errors are swallowed and logged so an
/// error-reporting hook can never mask the failure it reports on.
#[async_trait]
pub trait GlobalHook: Send + Sync {
    /// Stable name used in logs and error values.
    fn name(&self) -> &str;

    /// Runs before the operation; returning [`HookDecision::Halt`]
    /// short-circuits the remaining hooks and the operation itself.
    async fn before(
        &self,
        _ctx: &EvaluationContext,
        _operation: &str,
        _resource: &str,
    ) -> std::result::Result<HookDecision, StoreError> {
        Ok(HookDecision::Proceed)
    }

    /// Runs after the operation succeeded; `outcome` is an
    /// operation-defined summary.
    async fn after(
        &self,
        _ctx: &EvaluationContext,
        _operation: &str,
        _resource: &str,
        _outcome: &Value,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    /// Runs after the operation failed.
    async fn on_error(
        &self,
        _ctx: &EvaluationContext,
        _operation: &str,
        _resource: &str,
        _error: &Error,
    ) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

/// Ordered hook registry shared by handle.
///
/// Runs take a shallow snapshot of the list first, so a hook that
/// registers further hooks mid-flight affects later operations only.
#[derive(Clone, Default)]
pub struct GlobalHookManager {
    hooks: Arc<RwLock<Vec<Arc<dyn GlobalHook>>>>,
}

impl GlobalHookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hook; hooks run in registration order.
    pub fn register(&self, hook: Arc<dyn GlobalHook>) {
        self.hooks.write().expect("poisoned lock").push(hook);
    }

    /// Appends several hooks preserving their order.
    pub fn register_all(&self, hooks: impl IntoIterator<Item = Arc<dyn GlobalHook>>) {
        self.hooks.write().expect("poisoned lock").extend(hooks);
    }

    /// Read-only view of the current registration order.
    pub fn snapshot(&self) -> Vec<Arc<dyn GlobalHook>> {
        self.hooks.read().expect("poisoned lock").clone()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every `before` hook in order. The first halt verdict stops
    /// the walk and is returned; a hook error stops the walk as
    /// [`Error::HookFailed`].
    pub async fn run_before(
        &self,
        ctx: &EvaluationContext,
        operation: &str,
        resource: &str,
    ) -> Result<Option<HaltedBy>> {
        for hook in self.snapshot() {
            match hook.before(ctx, operation, resource).await {
                Ok(HookDecision::Proceed) => {}
                Ok(HookDecision::Halt { reason }) => {
                    return Ok(Some(HaltedBy {
                        hook: hook.name().to_string(),
                        reason,
                    }));
                }
                Err(source) => {
                    return Err(Error::HookFailed {
                        hook: hook.name().to_string(),
                        source,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Runs every `after` hook in order; the first error aborts the
    /// remainder and propagates as [`Error::HookFailed`].
    pub async fn run_after(
        &self,
        ctx: &EvaluationContext,
        operation: &str,
        resource: &str,
        outcome: &Value,
    ) -> Result<()> {
        for hook in self.snapshot() {
            hook.after(ctx, operation, resource, outcome)
                .await
                .map_err(|source| Error::HookFailed {
                    hook: hook.name().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Runs every `on_error` hook in order. Hook failures are logged
    /// and otherwise ignored.
    pub async fn run_on_error(
        &self,
        ctx: &EvaluationContext,
        operation: &str,
        resource: &str,
        error: &Error,
    ) {
        for hook in self.snapshot() {
            if let Err(hook_error) = hook.on_error(ctx, operation, resource, error).await {
                warn!(
                    hook = hook.name(),
                    operation,
                    resource,
                    error = %hook_error,
                    "error hook failed"
                );
            }
        }
    }
}

impl fmt::Debug for GlobalHookManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .snapshot()
            .iter()
            .map(|hook| hook.name().to_string())
            .collect();
        f.debug_struct("GlobalHookManager")
            .field("hooks", &names)
            .finish()
    }
}
