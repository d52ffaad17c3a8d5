//! Shared test utilities

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use deck_plugin_host::{
    ConfigStore, EntryTable, Error, GuardLimits, Plugin, PluginRegistry, Result,
};
use serde_json::{Map, Value, json};

/// Install a test tracing subscriber once per binary
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Plugin that answers every action with its (already validated) payload
pub struct EchoPlugin {
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn handles_actions(&self) -> bool {
        true
    }

    async fn handle_action(&self, _action: &str, payload: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(payload)
    }
}

/// Plugin whose handler always fails
pub struct BrokenPlugin {
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl Plugin for BrokenPlugin {
    fn handles_actions(&self) -> bool {
        true
    }

    async fn handle_action(&self, _action: &str, _payload: Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Plugin("handler exploded".to_string()))
    }
}

/// Plugin with no action handler
pub struct PassivePlugin;

#[async_trait]
impl Plugin for PassivePlugin {}

/// Plugin recording its lifecycle hook invocations
pub struct ProbePlugin {
    pub events: Arc<Mutex<Vec<String>>>,
    pub fail_unload: bool,
    pub fail_config_update: bool,
}

#[async_trait]
impl Plugin for ProbePlugin {
    async fn on_load(&mut self) -> Result<()> {
        self.record("load");
        Ok(())
    }

    async fn on_unload(&mut self) -> Result<()> {
        self.record("unload");
        if self.fail_unload {
            return Err(Error::Plugin("teardown failed".to_string()));
        }
        Ok(())
    }

    async fn on_config_update(&mut self, config: &Map<String, Value>) -> Result<()> {
        self.record(&format!("config:{}", serde_json::to_string(config).unwrap()));
        if self.fail_config_update {
            return Err(Error::Plugin("config rejected".to_string()));
        }
        Ok(())
    }
}

impl ProbePlugin {
    fn record(&self, event: &str) {
        self.events.lock().unwrap().push(event.to_string());
    }
}

/// A registry over temp directories, with a roomy memory ceiling so dispatch
/// is deterministic regardless of the test process's real footprint
pub fn new_host(entries: EntryTable) -> (tempfile::TempDir, Arc<ConfigStore>, PluginRegistry) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ConfigStore::new(dir.path().join("configs")).unwrap());
    let registry = PluginRegistry::new(dir.path().join("plugins"), Arc::clone(&store), entries)
        .unwrap()
        .with_guard_limits(GuardLimits {
            memory_limit: Some(u64::MAX),
            ..GuardLimits::default()
        });
    (dir, store, registry)
}

/// Write a bundle directory with a `plugin.json` under the plugin root
pub fn write_bundle(plugin_dir: &Path, name: &str, manifest: &Value) {
    let dir = plugin_dir.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("plugin.json"),
        serde_json::to_string_pretty(manifest).unwrap(),
    )
    .unwrap();
}

/// Manifest for a demo plugin with one `ping` action taking a bounded `msg`
pub fn demo_manifest() -> Value {
    json!({
        "name": "demo",
        "version": "1.0.0",
        "description": "demo plugin",
        "main": "demo",
        "author": "deck",
        "actions": [
            {
                "name": "ping",
                "parameters": {
                    "msg": {"type": "string", "maxLength": 10, "required": true}
                }
            }
        ]
    })
}
