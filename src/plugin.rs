use crate::error::{Error, Result, StoreError};
use crate::gate::PluginContext;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An installable extension with declared dependencies and lifecycle
/// callbacks.
///
/// `install` and `on_init` receive a [`PluginContext`] through which the
/// plugin registers resources, policies and hooks. Anything registered
/// there stays registered even if a later lifecycle step fails; only the
/// installed/initialized flags are rolled back.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin name.
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    /// Names of plugins that must be registered before this one and
    /// installed before it.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Fires synchronously during registration; a failure is logged but
    /// does not block the registration.
    fn on_register(&self) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    /// Installs the plugin's registrations.
    async fn install(&self, _ctx: &PluginContext) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    /// Runs after `install`; a failure rolls the plugin back to
    /// not-installed.
    async fn on_init(&self, _ctx: &PluginContext) -> std::result::Result<(), StoreError> {
        Ok(())
    }

    /// Runs during uninstall, before the installed flag clears; a
    /// failure is logged but does not block the uninstall.
    async fn on_destroy(&self) -> std::result::Result<(), StoreError> {
        Ok(())
    }
}

/// Introspection row for one registered plugin.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PluginStatus {
    pub name: String,
    pub version: String,
    pub dependencies: Vec<String>,
    pub installed: bool,
    pub initialized: bool,
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    installed: bool,
    initialized: bool,
}

/// Registry and lifecycle driver for plugins.
///
/// Registration order is preserved, and because a plugin can only be
/// registered after its dependencies, that order is always a valid
/// install order.
#[derive(Default)]
pub struct PluginManager {
    entries: Vec<PluginEntry>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin. Rejects duplicate names and undeclared
    /// dependencies; fires `on_register` synchronously.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.index_of(&name).is_some() {
            return Err(Error::DuplicatePlugin { plugin: name });
        }
        for dependency in plugin.dependencies() {
            if self.index_of(&dependency).is_none() {
                return Err(Error::PluginDependencyMissing {
                    plugin: name,
                    dependency,
                });
            }
        }
        if let Err(error) = plugin.on_register() {
            warn!(plugin = %name, %error, "plugin on_register failed");
        }
        debug!(plugin = %name, "plugin registered");
        self.entries.push(PluginEntry {
            plugin,
            installed: false,
            initialized: false,
        });
        Ok(())
    }

    /// Installs a plugin and, first, its not-yet-installed transitive
    /// dependencies. Already-installed plugins are skipped.
    pub async fn install(&mut self, name: &str, ctx: &PluginContext) -> Result<()> {
        let root = self.index_of(name).ok_or_else(|| Error::PluginNotFound {
            plugin: name.to_string(),
        })?;
        // Dependencies always sit earlier in the registration order, so
        // the ascending index walk installs them first.
        for index in self.closure_of(root)? {
            self.install_at(index, ctx).await?;
        }
        Ok(())
    }

    /// Installs every registered plugin in dependency order.
    pub async fn install_all(&mut self, ctx: &PluginContext) -> Result<()> {
        for index in 0..self.entries.len() {
            self.install_at(index, ctx).await?;
        }
        Ok(())
    }

    /// Uninstalls a plugin unless an installed plugin still depends on
    /// it. `on_destroy` failures are logged and do not block the
    /// uninstall. Uninstalling a plugin that is not installed is a
    /// no-op.
    pub async fn uninstall(&mut self, name: &str) -> Result<()> {
        let index = self.index_of(name).ok_or_else(|| Error::PluginNotFound {
            plugin: name.to_string(),
        })?;
        if !self.entries[index].installed {
            return Ok(());
        }
        for entry in &self.entries {
            if entry.installed
                && entry.plugin.name() != name
                && entry.plugin.dependencies().iter().any(|dep| dep == name)
            {
                return Err(Error::PluginRequired {
                    plugin: name.to_string(),
                    dependent: entry.plugin.name().to_string(),
                });
            }
        }
        let plugin = Arc::clone(&self.entries[index].plugin);
        if let Err(error) = plugin.on_destroy().await {
            warn!(plugin = name, %error, "plugin on_destroy failed");
        }
        self.entries[index].installed = false;
        self.entries[index].initialized = false;
        info!(plugin = name, "plugin uninstalled");
        Ok(())
    }

    /// Returns one status row per registered plugin, in registration
    /// order.
    pub fn states(&self) -> Vec<PluginStatus> {
        self.entries
            .iter()
            .map(|entry| PluginStatus {
                name: entry.plugin.name().to_string(),
                version: entry.plugin.version().to_string(),
                dependencies: entry.plugin.dependencies(),
                installed: entry.installed,
                initialized: entry.initialized,
            })
            .collect()
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.index_of(name)
            .is_some_and(|index| self.entries[index].installed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    async fn install_at(&mut self, index: usize, ctx: &PluginContext) -> Result<()> {
        if self.entries[index].installed {
            return Ok(());
        }
        let plugin = Arc::clone(&self.entries[index].plugin);
        let name = plugin.name().to_string();
        plugin
            .install(ctx)
            .await
            .map_err(|source| Error::PluginFailed {
                plugin: name.clone(),
                source,
            })?;
        self.entries[index].installed = true;
        if let Err(source) = plugin.on_init(ctx).await {
            // Roll back so a half-initialized plugin is never visible
            // as ready.
            self.entries[index].installed = false;
            self.entries[index].initialized = false;
            return Err(Error::PluginFailed {
                plugin: name,
                source,
            });
        }
        self.entries[index].initialized = true;
        info!(plugin = %name, "plugin installed");
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.plugin.name() == name)
    }

    /// Transitive dependency closure of one plugin, as ascending
    /// registration indices.
    fn closure_of(&self, root: usize) -> Result<BTreeSet<usize>> {
        let mut closure = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            if !closure.insert(index) {
                continue;
            }
            let entry = &self.entries[index];
            for dependency in entry.plugin.dependencies() {
                match self.index_of(&dependency) {
                    Some(dep_index) => stack.push(dep_index),
                    None => {
                        return Err(Error::PluginDependencyMissing {
                            plugin: entry.plugin.name().to_string(),
                            dependency,
                        });
                    }
                }
            }
        }
        Ok(closure)
    }
}
