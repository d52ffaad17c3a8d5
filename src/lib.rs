//! Deck plugin host - plugin execution subsystem for the Deck remote
//! control-surface host
//!
//! This library loads third-party plugin bundles, holds them to a declared
//! manifest, constrains what they can do at runtime, and persists their
//! configuration:
//! - Plugin registry: bundle discovery, manifest validation, lifecycle,
//!   guarded action dispatch
//! - Execution guard: per-plugin timeouts, retries, input validation, a
//!   coarse memory ceiling, and an error-count circuit breaker
//! - Configuration store: durable, validated, cached per-plugin settings
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │           Message dispatch (external)           │
//! └────────────────────┬────────────────────────────┘
//!                      │ execute_action
//! ┌────────────────────▼────────────────────────────┐
//! │                Plugin Registry                  │
//! │   discovery  │  manifests  │  lifecycle         │
//! └───────┬─────────────────────────────┬───────────┘
//!         │ per plugin                  │
//! ┌───────▼───────────┐   ┌─────────────▼───────────┐
//! │  Execution Guard  │   │   Configuration Store   │
//! │  timeout/retry    │   │   cache + JSON on disk  │
//! │  circuit breaker  │   └─────────────────────────┘
//! └───────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod guard;
pub mod plugins;

pub use config::{ConfigFieldType, ConfigSchema, ConfigStore};
pub use error::{Error, Result};
pub use guard::input::{ParamMap, ParamSpec, ParamType, sanitize, validate_input};
pub use guard::{ExecutionGuard, GuardEvent, GuardStats, IsolatedContext, WrapOptions};
pub use plugins::{
    ActionDecl, EntryTable, GuardLimits, Manifest, Plugin, PluginContext, PluginRecord,
    PluginRegistry, PluginSummary,
};
