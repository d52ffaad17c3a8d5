//! Action payload validation and sanitization
//!
//! Manifests declare per-action parameter schemas; every payload is walked
//! against its schema before the plugin's handler runs. Validation produces a
//! fresh map containing only the declared fields, with strings sanitized.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

static JAVASCRIPT_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript:").expect("valid regex"));

static EVENT_HANDLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)on\w+=").expect("valid regex"));

/// Parameter schema for one action: field name to validation rules
pub type ParamMap = BTreeMap<String, ParamSpec>;

/// Declared type of a parameter field
///
/// Unrecognized type strings deserialize as [`ParamType::Any`], which passes
/// values through untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// UTF-8 string, length-bounded and sanitized
    #[default]
    String,
    /// Numeric value with optional inclusive bounds
    Number,
    /// Coerced to a boolean
    Boolean,
    /// Array with optional size bound and per-element schema
    Array,
    /// Nested object validated against `properties`
    Object,
    /// No validation; value passes through unchanged
    #[serde(other)]
    Any,
}

/// Validation rules for one parameter field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    /// Declared type (defaults to string)
    #[serde(rename = "type", default)]
    pub kind: ParamType,
    /// Whether the field must be present in the payload
    #[serde(default)]
    pub required: bool,
    /// Minimum value for numbers (inclusive)
    #[serde(default)]
    pub min: Option<f64>,
    /// Maximum value for numbers (inclusive)
    #[serde(default)]
    pub max: Option<f64>,
    /// Maximum length for strings
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Maximum element count for arrays
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Schema applied to each array element
    #[serde(default)]
    pub items: Option<ParamMap>,
    /// Schema applied to nested object fields
    #[serde(default)]
    pub properties: Option<ParamMap>,
}

/// Validate a payload against a parameter schema
///
/// Returns a fresh map holding only the declared fields. Fields present in
/// the payload but absent from the schema are dropped. A declared field
/// missing from the payload fails with [`Error::Validation`] when marked
/// required, and is simply omitted otherwise.
pub fn validate_input(input: &Map<String, Value>, schema: &ParamMap) -> Result<Map<String, Value>> {
    let mut validated = Map::new();

    for (key, spec) in schema {
        match input.get(key) {
            Some(value) => {
                validated.insert(key.clone(), validate_value(key, value, spec)?);
            }
            None if spec.required => {
                return Err(Error::Validation(format!("required field missing: {key}")));
            }
            None => {}
        }
    }

    Ok(validated)
}

fn validate_value(key: &str, value: &Value, spec: &ParamSpec) -> Result<Value> {
    match spec.kind {
        ParamType::String => {
            let Value::String(s) = value else {
                return Err(Error::Validation(format!(
                    "invalid type for {key}: expected string"
                )));
            };
            if let Some(max_length) = spec.max_length {
                if s.chars().count() > max_length {
                    return Err(Error::Validation(format!(
                        "value too long for {key}: max {max_length} characters"
                    )));
                }
            }
            Ok(Value::String(sanitize(s)))
        }
        ParamType::Number => {
            let Some(n) = value.as_f64() else {
                return Err(Error::Validation(format!(
                    "invalid type for {key}: expected number"
                )));
            };
            if let Some(min) = spec.min {
                if n < min {
                    return Err(Error::Validation(format!(
                        "value too small for {key}: min {min}"
                    )));
                }
            }
            if let Some(max) = spec.max {
                if n > max {
                    return Err(Error::Validation(format!(
                        "value too large for {key}: max {max}"
                    )));
                }
            }
            Ok(value.clone())
        }
        ParamType::Boolean => Ok(Value::Bool(truthy(value))),
        ParamType::Array => {
            let Value::Array(elements) = value else {
                return Err(Error::Validation(format!(
                    "invalid type for {key}: expected array"
                )));
            };
            if let Some(max_items) = spec.max_items {
                if elements.len() > max_items {
                    return Err(Error::Validation(format!(
                        "array too large for {key}: max {max_items} items"
                    )));
                }
            }
            match &spec.items {
                Some(item_schema) => {
                    let mut validated = Vec::with_capacity(elements.len());
                    for element in elements {
                        let Value::Object(fields) = element else {
                            return Err(Error::Validation(format!(
                                "invalid element in {key}: expected object"
                            )));
                        };
                        validated.push(Value::Object(validate_input(fields, item_schema)?));
                    }
                    Ok(Value::Array(validated))
                }
                None => Ok(value.clone()),
            }
        }
        ParamType::Object => {
            let Value::Object(fields) = value else {
                return Err(Error::Validation(format!(
                    "invalid type for {key}: expected object"
                )));
            };
            match &spec.properties {
                Some(properties) => Ok(Value::Object(validate_input(fields, properties)?)),
                None => Ok(value.clone()),
            }
        }
        ParamType::Any => Ok(value.clone()),
    }
}

/// JS-style truthiness for boolean coercion
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Strip injection-prone content from a string value
///
/// Removes `<`/`>` characters, case-insensitive `javascript:` prefixes, and
/// `on<word>=` event-handler patterns, then trims surrounding whitespace.
#[must_use]
pub fn sanitize(input: &str) -> String {
    let stripped: String = input.chars().filter(|c| *c != '<' && *c != '>').collect();
    let stripped = JAVASCRIPT_SCHEME.replace_all(&stripped, "");
    let stripped = EVENT_HANDLER.replace_all(&stripped, "");
    stripped.trim().to_string()
}
