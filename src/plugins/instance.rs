//! Plugin contract and entry-point table
//!
//! Plugin code is late-bound: a manifest's `main` entry names a constructor
//! in the host's entry table rather than a dynamically loaded module. The
//! contract itself is the four optional lifecycle hooks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Everything a plugin receives at construction time
#[derive(Debug, Clone)]
pub struct PluginContext {
    /// Plugin name (bundle directory name)
    pub name: String,
    /// Version from the manifest
    pub version: String,
    /// Merged configuration (manifest defaults under persisted values)
    pub config: Map<String, Value>,
    /// Directory the bundle was discovered in
    pub plugin_dir: PathBuf,
}

/// Contract implemented by plugin code
///
/// Every hook has a default implementation, so a plugin overrides only what
/// it needs. A plugin that handles actions overrides both
/// [`Plugin::handles_actions`] and [`Plugin::handle_action`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once after construction, before the plugin is registered
    ///
    /// # Errors
    ///
    /// A failure here fails the whole load; the plugin is not registered.
    async fn on_load(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called on unload; failures are logged, never propagated
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails.
    async fn on_unload(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether this plugin exposes an action handler
    fn handles_actions(&self) -> bool {
        false
    }

    /// Handle one action invocation
    ///
    /// The payload has already been validated against the action's declared
    /// parameter schema, when one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the action fails; the registry's guard applies
    /// timeout and retries around this call.
    async fn handle_action(&self, action: &str, payload: Value) -> Result<Value> {
        let _ = payload;
        Err(Error::UnsupportedAction(action.to_string()))
    }

    /// Called after the plugin's config changed; failures are logged, never
    /// propagated
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin rejects the new config.
    async fn on_config_update(&mut self, config: &Map<String, Value>) -> Result<()> {
        let _ = config;
        Ok(())
    }
}

/// Constructor for one plugin entry point
pub type PluginFactory = Arc<dyn Fn(PluginContext) -> Result<Box<dyn Plugin>> + Send + Sync>;

/// Table mapping manifest `main` entries to plugin constructors
#[derive(Default, Clone)]
pub struct EntryTable {
    factories: HashMap<String, PluginFactory>,
}

impl EntryTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under an entry name
    pub fn register<F>(&mut self, entry: impl Into<String>, factory: F)
    where
        F: Fn(PluginContext) -> Result<Box<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.insert(entry.into(), Arc::new(factory));
    }

    /// Look up the constructor for an entry name
    #[must_use]
    pub fn resolve(&self, entry: &str) -> Option<PluginFactory> {
        self.factories.get(entry).cloned()
    }

    /// Number of registered entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no entries are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {}

    #[tokio::test]
    async fn default_hooks_are_noops() {
        let mut plugin = Noop;
        plugin.on_load().await.unwrap();
        plugin.on_unload().await.unwrap();
        plugin.on_config_update(&Map::new()).await.unwrap();
        assert!(!plugin.handles_actions());

        let err = plugin.handle_action("ping", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedAction(_)));
    }

    #[test]
    fn entries_resolve_after_registration() {
        let mut table = EntryTable::new();
        assert!(table.is_empty());

        table.register("noop", |_ctx| Ok(Box::new(Noop) as Box<dyn Plugin>));
        assert_eq!(table.len(), 1);
        assert!(table.resolve("noop").is_some());
        assert!(table.resolve("other").is_none());
    }
}
