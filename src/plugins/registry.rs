//! Plugin registry - discovery, lifecycle, and guarded action dispatch

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::config::ConfigStore;
use crate::error::{Error, Result};
use crate::guard::{ExecutionGuard, GuardStats, WrapOptions};

use super::instance::{EntryTable, Plugin, PluginContext};
use super::manifest::{MANIFEST_FILE, Manifest};

/// Limits applied to every guard the registry creates
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardLimits {
    /// Per-invocation timeout; `None` keeps the guard default
    pub timeout: Option<Duration>,
    /// Memory ceiling in bytes; `None` keeps the guard default
    pub memory_limit: Option<u64>,
    /// Circuit-breaker threshold; `None` keeps the guard default
    pub max_errors: Option<u32>,
}

/// A loaded, live plugin
///
/// Created on load, mutated by enable/disable and config updates, destroyed
/// on unload. The guard is owned by the record and never shared with another
/// plugin.
#[derive(Clone)]
pub struct PluginRecord {
    /// Plugin name (bundle directory name)
    pub name: String,
    /// Declared contract, immutable after load
    pub manifest: Manifest,
    /// Merged configuration (manifest defaults under persisted values)
    pub config: Map<String, Value>,
    /// Whether action dispatch is allowed
    pub enabled: bool,
    instance: Arc<RwLock<Box<dyn Plugin>>>,
    guard: Arc<ExecutionGuard>,
}

impl PluginRecord {
    /// The guard attached to this plugin
    #[must_use]
    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    /// Snapshot of the guard's state for diagnostics
    #[must_use]
    pub fn guard_stats(&self) -> GuardStats {
        self.guard.stats()
    }
}

/// One row of [`PluginRegistry::list`]
#[derive(Debug, Clone, Serialize)]
pub struct PluginSummary {
    /// Plugin name
    pub name: String,
    /// Version from the manifest
    pub version: String,
    /// Whether action dispatch is allowed
    pub enabled: bool,
    /// Short description from the manifest
    pub description: String,
    /// Plugin author, when declared
    pub author: Option<String>,
}

/// Registry of loaded plugins
///
/// Discovers bundles under one plugin root, validates their manifests, merges
/// configuration through a [`ConfigStore`], constructs instances through an
/// [`EntryTable`], and routes every action invocation through the plugin's
/// own [`ExecutionGuard`].
pub struct PluginRegistry {
    plugin_dir: PathBuf,
    store: Arc<ConfigStore>,
    entries: EntryTable,
    guard_limits: GuardLimits,
    plugins: RwLock<HashMap<String, PluginRecord>>,
}

impl PluginRegistry {
    /// Create a registry rooted at `plugin_dir`, creating the root if absent
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin root cannot be created.
    pub fn new(
        plugin_dir: impl Into<PathBuf>,
        store: Arc<ConfigStore>,
        entries: EntryTable,
    ) -> Result<Self> {
        let plugin_dir = plugin_dir.into();
        std::fs::create_dir_all(&plugin_dir)?;
        Ok(Self {
            plugin_dir,
            store,
            entries,
            guard_limits: GuardLimits::default(),
            plugins: RwLock::new(HashMap::new()),
        })
    }

    /// Override the limits applied to every guard created from now on
    #[must_use]
    pub fn with_guard_limits(mut self, limits: GuardLimits) -> Self {
        self.guard_limits = limits;
        self
    }

    /// Default plugin root: `<config>/deck/plugins`
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        directories::BaseDirs::new().map(|d| d.config_dir().join("deck").join("plugins"))
    }

    /// Directory bundles are discovered in
    #[must_use]
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Discover and load every bundle under the plugin root
    ///
    /// Bundles are processed sequentially; a failure in one is logged and
    /// does not abort the scan. Returns the names that loaded.
    pub async fn load_all(&self) -> Vec<String> {
        let mut candidates = Vec::new();
        match std::fs::read_dir(&self.plugin_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    if entry.path().is_dir() {
                        if let Ok(name) = entry.file_name().into_string() {
                            candidates.push(name);
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.plugin_dir.display(),
                    error = %e,
                    "failed to read plugin directory"
                );
                return Vec::new();
            }
        }
        candidates.sort();

        let mut loaded = Vec::new();
        for name in candidates {
            if self.plugins.read().await.contains_key(&name) {
                tracing::debug!(plugin = %name, "plugin already loaded, skipping");
                continue;
            }
            match self.load(&name).await {
                Ok(()) => loaded.push(name),
                Err(e) => {
                    tracing::warn!(plugin = %name, error = %e, "failed to load plugin");
                }
            }
        }

        tracing::info!(count = loaded.len(), "plugin scan complete");
        loaded
    }

    /// Load one bundle by name
    ///
    /// Validates the manifest, merges the manifest's default config with the
    /// persisted entry (persisted values win), constructs the instance with a
    /// fresh guard, and runs the load hook before registering.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestValidation`] when the manifest is absent,
    /// unparsable, or incomplete, and [`Error::PluginLoad`] when the entry is
    /// unknown, the name is already registered, or the load hook fails.
    pub async fn load(&self, name: &str) -> Result<()> {
        if self.plugins.read().await.contains_key(name) {
            return Err(Error::PluginLoad(format!("plugin already loaded: {name}")));
        }

        let bundle_dir = self.plugin_dir.join(name);
        let manifest = read_manifest(&bundle_dir)?;
        manifest.validate()?;

        let mut config = manifest.config.clone();
        for (key, value) in self.store.load_config(name) {
            config.insert(key, value);
        }
        let enabled = !matches!(config.get("enabled"), Some(Value::Bool(false)));

        let factory = self
            .entries
            .resolve(&manifest.main)
            .ok_or_else(|| Error::PluginLoad(format!("unknown entry point: {}", manifest.main)))?;

        let guard = Arc::new(self.build_guard(name));
        let context = PluginContext {
            name: name.to_string(),
            version: manifest.version.clone(),
            config: config.clone(),
            plugin_dir: bundle_dir,
        };

        let mut instance = factory(context)?;
        instance
            .on_load()
            .await
            .map_err(|e| Error::PluginLoad(format!("load hook failed for {name}: {e}")))?;

        tracing::info!(
            plugin = %name,
            version = %manifest.version,
            enabled,
            "plugin loaded"
        );

        self.plugins.write().await.insert(
            name.to_string(),
            PluginRecord {
                name: name.to_string(),
                manifest,
                config,
                enabled,
                instance: Arc::new(RwLock::new(instance)),
                guard,
            },
        );

        Ok(())
    }

    /// Unload a plugin, running its unload hook best-effort
    ///
    /// Hook failures are logged and do not keep the record alive. The
    /// plugin's guard is discarded with the record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PluginNotFound`] if no plugin is registered under
    /// `name`.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let record = self
            .plugins
            .write()
            .await
            .remove(name)
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))?;

        if let Err(e) = record.instance.write().await.on_unload().await {
            tracing::warn!(plugin = %name, error = %e, "unload hook failed");
        }

        tracing::info!(plugin = %name, "plugin unloaded");
        Ok(())
    }

    /// Allow action dispatch for a plugin, persisting the flag
    ///
    /// # Errors
    ///
    /// Returns [`Error::PluginNotFound`] if unknown, or a store error if the
    /// flag cannot be persisted.
    pub async fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true).await
    }

    /// Block action dispatch for a plugin, persisting the flag
    ///
    /// # Errors
    ///
    /// Returns [`Error::PluginNotFound`] if unknown, or a store error if the
    /// flag cannot be persisted.
    pub async fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false).await
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut plugins = self.plugins.write().await;
        let record = plugins
            .get_mut(name)
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))?;

        let mut updates = Map::new();
        updates.insert("enabled".to_string(), Value::Bool(enabled));
        record.config = self.store.update_config(name, updates)?;
        record.enabled = enabled;

        tracing::info!(plugin = %name, enabled, "plugin state changed");
        Ok(())
    }

    /// Execute one action against a loaded plugin
    ///
    /// The payload is validated against the action's declared parameter
    /// schema when the manifest carries one; the handler then sees the
    /// validated, sanitized copy. The invocation runs through the plugin's
    /// guard: memory ceiling first, then the timeout/retry wrapper.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PluginNotFound`], [`Error::PluginDisabled`],
    /// [`Error::UnsupportedAction`], [`Error::Validation`],
    /// [`Error::MemoryLimitExceeded`], [`Error::ExecutionTimeout`], or
    /// [`Error::ExecutionFailed`], in that order of checks.
    pub async fn execute_action(
        &self,
        name: &str,
        action: &str,
        payload: Map<String, Value>,
    ) -> Result<Value> {
        let (instance, guard, schema) = {
            let plugins = self.plugins.read().await;
            let record = plugins
                .get(name)
                .ok_or_else(|| Error::PluginNotFound(name.to_string()))?;
            if !record.enabled {
                return Err(Error::PluginDisabled(name.to_string()));
            }
            let schema = record
                .manifest
                .action(action)
                .and_then(|decl| decl.parameters.clone());
            (Arc::clone(&record.instance), Arc::clone(&record.guard), schema)
        };

        if !instance.read().await.handles_actions() {
            return Err(Error::UnsupportedAction(name.to_string()));
        }

        let payload = match schema {
            Some(schema) => guard.validate_input(&payload, &schema)?,
            None => payload,
        };

        guard.check_memory_usage()?;

        tracing::debug!(plugin = %name, action, "dispatching action");
        let action = action.to_string();
        guard
            .run_wrapped(WrapOptions::default(), move || {
                let instance = Arc::clone(&instance);
                let action = action.clone();
                let payload = payload.clone();
                Box::pin(async move {
                    instance
                        .read()
                        .await
                        .handle_action(&action, Value::Object(payload))
                        .await
                })
            })
            .await
    }

    /// Current configuration for a plugin
    ///
    /// # Errors
    ///
    /// Returns [`Error::PluginNotFound`] if unknown.
    pub async fn get_config(&self, name: &str) -> Result<Map<String, Value>> {
        let plugins = self.plugins.read().await;
        plugins
            .get(name)
            .map(|record| record.config.clone())
            .ok_or_else(|| Error::PluginNotFound(name.to_string()))
    }

    /// Merge `updates` into a plugin's config and notify the instance
    ///
    /// The config-changed hook is best-effort: a failure is logged and the
    /// update stays applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PluginNotFound`] if unknown, or a store error on
    /// validation/persistence failure (record left unchanged).
    pub async fn update_config(
        &self,
        name: &str,
        updates: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let (instance, merged) = {
            let mut plugins = self.plugins.write().await;
            let record = plugins
                .get_mut(name)
                .ok_or_else(|| Error::PluginNotFound(name.to_string()))?;
            let merged = self.store.update_config(name, updates)?;
            record.config = merged.clone();
            record.enabled = !matches!(merged.get("enabled"), Some(Value::Bool(false)));
            (Arc::clone(&record.instance), merged)
        };

        self.notify_config_update(name, &instance, &merged).await;
        Ok(merged)
    }

    /// Restore a plugin's config to its declared defaults
    ///
    /// Defaults are the store's built-in table for the id overlaid with the
    /// manifest's default config, persisted through the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PluginNotFound`] if unknown, or a store error on
    /// persistence failure.
    pub async fn reset_config(&self, name: &str) -> Result<Map<String, Value>> {
        let (instance, defaults) = {
            let mut plugins = self.plugins.write().await;
            let record = plugins
                .get_mut(name)
                .ok_or_else(|| Error::PluginNotFound(name.to_string()))?;

            let mut defaults = ConfigStore::default_config(name);
            for (key, value) in record.manifest.config.clone() {
                defaults.insert(key, value);
            }
            let saved = self.store.save_config(name, defaults)?;
            record.config = saved.clone();
            record.enabled = !matches!(saved.get("enabled"), Some(Value::Bool(false)));
            (Arc::clone(&record.instance), saved)
        };

        self.notify_config_update(name, &instance, &defaults).await;
        Ok(defaults)
    }

    async fn notify_config_update(
        &self,
        name: &str,
        instance: &Arc<RwLock<Box<dyn Plugin>>>,
        config: &Map<String, Value>,
    ) {
        if let Err(e) = instance.write().await.on_config_update(config).await {
            tracing::warn!(plugin = %name, error = %e, "config update hook failed");
        }
    }

    /// Summaries of every registered plugin
    pub async fn list(&self) -> Vec<PluginSummary> {
        let plugins = self.plugins.read().await;
        let mut summaries: Vec<PluginSummary> = plugins
            .values()
            .map(|record| PluginSummary {
                name: record.name.clone(),
                version: record.manifest.version.clone(),
                enabled: record.enabled,
                description: record.manifest.description.clone(),
                author: record.manifest.author.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// The record registered under `name`, if any
    pub async fn get(&self, name: &str) -> Option<PluginRecord> {
        self.plugins.read().await.get(name).cloned()
    }

    /// Number of registered plugins
    pub async fn len(&self) -> usize {
        self.plugins.read().await.len()
    }

    /// Whether no plugins are registered
    pub async fn is_empty(&self) -> bool {
        self.plugins.read().await.is_empty()
    }

    fn build_guard(&self, name: &str) -> ExecutionGuard {
        let mut guard = ExecutionGuard::new(name);
        if let Some(timeout) = self.guard_limits.timeout {
            guard = guard.with_timeout(timeout);
        }
        if let Some(memory_limit) = self.guard_limits.memory_limit {
            guard = guard.with_memory_limit(memory_limit);
        }
        if let Some(max_errors) = self.guard_limits.max_errors {
            guard = guard.with_max_errors(max_errors);
        }
        guard
    }
}

fn read_manifest(bundle_dir: &Path) -> Result<Manifest> {
    let path = bundle_dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|_| {
        Error::ManifestValidation(format!("manifest not found: {}", path.display()))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| Error::ManifestValidation(format!("unparsable manifest: {e}")))
}
