//! Plugin manifest format (`plugin.json`)

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::guard::input::ParamMap;

/// Manifest file name inside a plugin bundle
pub const MANIFEST_FILE: &str = "plugin.json";

static VERSION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+").expect("valid regex"));

/// Declared contract of a plugin
///
/// Read once at discovery time and immutable thereafter. All fields default
/// on deserialization so that an incomplete manifest is reported by
/// [`Manifest::validate`] rather than as a parse error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Plugin name
    #[serde(default)]
    pub name: String,
    /// Semantic version string (`major.minor.patch`, suffixes allowed)
    #[serde(default)]
    pub version: String,
    /// Short description
    #[serde(default)]
    pub description: String,
    /// Entry reference resolved through the registry's entry table
    #[serde(default)]
    pub main: String,
    /// Plugin author
    #[serde(default)]
    pub author: Option<String>,
    /// Callable capabilities this plugin exposes
    #[serde(default)]
    pub actions: Vec<ActionDecl>,
    /// Default configuration, overridden by persisted entries
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Manifest {
    /// Check the declared contract for completeness
    ///
    /// # Errors
    ///
    /// Returns [`Error::ManifestValidation`] when any of name, version,
    /// description, or main is missing, or when the version string lacks a
    /// `major.minor.patch` prefix.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("name", &self.name),
            ("version", &self.version),
            ("description", &self.description),
            ("main", &self.main),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(Error::ManifestValidation(format!(
                    "missing required field: {field}"
                )));
            }
        }

        if !VERSION_PREFIX.is_match(&self.version) {
            return Err(Error::ManifestValidation(format!(
                "invalid version format: {}",
                self.version
            )));
        }

        Ok(())
    }

    /// Look up an action declaration by name
    #[must_use]
    pub fn action(&self, name: &str) -> Option<&ActionDecl> {
        self.actions.iter().find(|a| a.name == name)
    }
}

/// One callable capability declared by a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDecl {
    /// Action name
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
    /// Parameter schema applied to payloads before dispatch
    #[serde(default)]
    pub parameters: Option<ParamMap>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn manifest(json: Value) -> Manifest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn complete_manifest_validates() {
        let m = manifest(json!({
            "name": "obs",
            "version": "1.2.3",
            "description": "OBS scene control",
            "main": "obs",
            "author": "deck",
            "actions": [
                {
                    "name": "switch-scene",
                    "parameters": {
                        "scene": {"type": "string", "maxLength": 64, "required": true}
                    }
                }
            ],
            "config": {"host": "localhost"}
        }));

        m.validate().unwrap();
        assert_eq!(m.name, "obs");
        assert!(m.action("switch-scene").is_some());
        assert!(m.action("missing").is_none());
        assert_eq!(m.config["host"], "localhost");
    }

    #[test]
    fn missing_fields_are_rejected() {
        for dropped in ["name", "version", "description", "main"] {
            let mut value = json!({
                "name": "x",
                "version": "1.0.0",
                "description": "d",
                "main": "x"
            });
            value.as_object_mut().unwrap().remove(dropped);

            let err = manifest(value).validate().unwrap_err();
            assert!(
                err.to_string().contains(dropped),
                "expected {dropped} in: {err}"
            );
        }
    }

    #[test]
    fn version_needs_major_minor_patch_prefix() {
        let mut m = manifest(json!({
            "name": "x",
            "version": "1.0",
            "description": "d",
            "main": "x"
        }));
        assert!(m.validate().is_err());

        m.version = "1.0.0-beta.2".to_string();
        m.validate().unwrap();
    }

    #[test]
    fn parameters_deserialize_into_schema() {
        let m = manifest(json!({
            "name": "x",
            "version": "1.0.0",
            "description": "d",
            "main": "x",
            "actions": [
                {
                    "name": "go",
                    "parameters": {
                        "count": {"type": "number", "min": 1, "max": 10}
                    }
                }
            ]
        }));

        let params = m.action("go").unwrap().parameters.as_ref().unwrap();
        let spec = params.get("count").unwrap();
        assert_eq!(spec.min, Some(1.0));
        assert_eq!(spec.max, Some(10.0));
    }
}
