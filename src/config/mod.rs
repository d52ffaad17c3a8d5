//! Per-plugin configuration store
//!
//! One JSON file per plugin id under a config root, fronted by an in-memory
//! cache and validated schema-lite on write. Loads never fail: absent or
//! unparsable files fall back to the declared defaults for well-known plugin
//! ids, or an empty map for everything else.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

/// Field types understood by config schemas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFieldType {
    /// UTF-8 string
    String,
    /// Numeric value
    Number,
    /// Boolean
    Boolean,
    /// Nested object
    Object,
    /// Array
    Array,
}

/// Schema-lite validation rules for one plugin's config
///
/// Checks required-field presence and per-field types; everything else passes
/// through. Plugins without a registered schema get a permissive empty one.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    /// Fields that must be present on every save
    pub required: Vec<String>,
    /// Per-field type checks
    pub properties: HashMap<String, ConfigFieldType>,
}

impl ConfigSchema {
    fn validate(&self, id: &str, config: &Map<String, Value>) -> Result<()> {
        for field in &self.required {
            if !config.contains_key(field) {
                return Err(Error::ConfigValidation(format!(
                    "required field missing: {field}"
                )));
            }
        }

        for (field, expected) in &self.properties {
            let Some(value) = config.get(field) else {
                continue;
            };
            let matches = match expected {
                ConfigFieldType::String => value.is_string(),
                ConfigFieldType::Number => value.is_number(),
                ConfigFieldType::Boolean => value.is_boolean(),
                ConfigFieldType::Object => value.is_object(),
                ConfigFieldType::Array => value.is_array(),
            };
            if !matches {
                return Err(Error::ConfigValidation(format!(
                    "field {field} of {id} must be a {}",
                    type_name(*expected)
                )));
            }
        }

        Ok(())
    }
}

fn type_name(field_type: ConfigFieldType) -> &'static str {
    match field_type {
        ConfigFieldType::String => "string",
        ConfigFieldType::Number => "number",
        ConfigFieldType::Boolean => "boolean",
        ConfigFieldType::Object => "object",
        ConfigFieldType::Array => "array",
    }
}

/// Durable, cached configuration for plugins
pub struct ConfigStore {
    config_dir: PathBuf,
    cache: RwLock<HashMap<String, Map<String, Value>>>,
    schemas: RwLock<HashMap<String, ConfigSchema>>,
}

impl ConfigStore {
    /// Create a store rooted at `config_dir`, creating the directory if absent
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(config_dir: impl Into<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.into();
        fs::create_dir_all(&config_dir)?;
        Ok(Self {
            config_dir,
            cache: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
        })
    }

    /// Default config root: `<config>/deck/plugin-config`
    #[must_use]
    pub fn default_dir() -> Option<PathBuf> {
        directories::BaseDirs::new()
            .map(|d| d.config_dir().join("deck").join("plugin-config"))
    }

    /// Directory configs are persisted under
    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Register a validation schema for a plugin id
    pub fn set_schema(&self, id: impl Into<String>, schema: ConfigSchema) {
        self.schemas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), schema);
    }

    /// Load a plugin's config, serving the cache when warm
    ///
    /// Falls back to [`ConfigStore::default_config`] when the file is absent
    /// or unparsable. Always populates the cache before returning.
    #[must_use]
    pub fn load_config(&self, id: &str) -> Map<String, Value> {
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
        {
            return cached.clone();
        }

        let path = self.config_path(id);
        let config = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        plugin = %id,
                        path = %path.display(),
                        error = %e,
                        "unparsable config file, using defaults"
                    );
                    Self::default_config(id)
                }
            },
            Err(_) => Self::default_config(id),
        };

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), config.clone());
        config
    }

    /// Validate and persist a plugin's config, updating the cache
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] on schema mismatch (disk and cache
    /// untouched), or an IO/serialization error if the write fails.
    pub fn save_config(&self, id: &str, config: Map<String, Value>) -> Result<Map<String, Value>> {
        let schema = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .or_else(|| Self::default_schema(id))
            .unwrap_or_default();
        schema.validate(id, &config)?;

        fs::create_dir_all(&self.config_dir)?;
        let path = self.config_path(id);
        fs::write(&path, serde_json::to_string_pretty(&config)?)?;

        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), config.clone());

        tracing::info!(plugin = %id, "config saved");
        Ok(config)
    }

    /// Shallow-merge `updates` over the current config and save
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ConfigStore::save_config`].
    pub fn update_config(
        &self,
        id: &str,
        updates: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut config = self.load_config(id);
        for (key, value) in updates {
            config.insert(key, value);
        }
        self.save_config(id, config)
    }

    /// Delete a plugin's persisted config (idempotent)
    ///
    /// # Errors
    ///
    /// Returns an IO error only if an existing file cannot be removed.
    pub fn delete_config(&self, id: &str) -> Result<()> {
        let path = self.config_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(plugin = %id, "config deleted");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }

    /// Restore a plugin's config to its declared defaults
    ///
    /// # Errors
    ///
    /// Same failure modes as [`ConfigStore::save_config`].
    pub fn reset_config(&self, id: &str) -> Result<Map<String, Value>> {
        self.save_config(id, Self::default_config(id))
    }

    /// List every persisted config under the root
    #[must_use]
    pub fn list_configs(&self) -> HashMap<String, Map<String, Value>> {
        let mut configs = HashMap::new();

        let entries = match fs::read_dir(&self.config_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list config directory");
                return configs;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                    configs.insert(id.to_string(), self.load_config(id));
                }
            }
        }

        configs
    }

    /// Drop every cached entry
    pub fn clear_cache(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Force a disk re-read for one plugin, bypassing the cache
    #[must_use]
    pub fn reload_config(&self, id: &str) -> Map<String, Value> {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.load_config(id)
    }

    /// Declared default config for well-known plugin ids
    ///
    /// Unknown ids get an empty map.
    #[must_use]
    pub fn default_config(id: &str) -> Map<String, Value> {
        let defaults = match id {
            "discord" => json!({
                "enabled": true,
                "token": "",
                "clientId": "",
                "guildId": "",
                "channelId": "",
                "autoReconnect": true,
                "reconnectDelay": 5000
            }),
            "spotify" => json!({
                "enabled": true,
                "clientId": "",
                "clientSecret": "",
                "redirectUri": "http://localhost:3000/callback",
                "accessToken": "",
                "refreshToken": "",
                "autoRefresh": true
            }),
            "obs" => json!({
                "enabled": true,
                "host": "localhost",
                "port": 4455,
                "password": "",
                "autoReconnect": true,
                "reconnectDelay": 5000
            }),
            _ => return Map::new(),
        };
        defaults.as_object().cloned().unwrap_or_default()
    }

    /// Declared schemas for the well-known plugin ids
    fn default_schema(id: &str) -> Option<ConfigSchema> {
        use ConfigFieldType::{Boolean, Number, String as Str};

        let properties: &[(&str, ConfigFieldType)] = match id {
            "discord" => &[
                ("enabled", Boolean),
                ("token", Str),
                ("clientId", Str),
                ("guildId", Str),
                ("channelId", Str),
                ("autoReconnect", Boolean),
                ("reconnectDelay", Number),
            ],
            "spotify" => &[
                ("enabled", Boolean),
                ("clientId", Str),
                ("clientSecret", Str),
                ("redirectUri", Str),
                ("accessToken", Str),
                ("refreshToken", Str),
                ("autoRefresh", Boolean),
            ],
            "obs" => &[
                ("enabled", Boolean),
                ("host", Str),
                ("port", Number),
                ("password", Str),
                ("autoReconnect", Boolean),
                ("reconnectDelay", Number),
            ],
            _ => return None,
        };

        Some(ConfigSchema {
            required: Vec::new(),
            properties: properties
                .iter()
                .map(|(field, field_type)| ((*field).to_string(), *field_type))
                .collect(),
        })
    }

    fn config_path(&self, id: &str) -> PathBuf {
        self.config_dir.join(format!("{id}.json"))
    }
}
