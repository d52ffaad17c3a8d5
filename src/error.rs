//! Error types for the Deck plugin host

use thiserror::Error;

/// Result type alias for plugin host operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the plugin host
#[derive(Debug, Error)]
pub enum Error {
    /// Plugin manifest absent, incomplete, or malformed
    #[error("invalid plugin manifest: {0}")]
    ManifestValidation(String),

    /// No plugin registered under the given name
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Plugin is loaded but disabled
    #[error("plugin is disabled: {0}")]
    PluginDisabled(String),

    /// Plugin exposes no action handler
    #[error("plugin does not support actions: {0}")]
    UnsupportedAction(String),

    /// Action payload rejected by schema validation
    #[error("invalid payload: {0}")]
    Validation(String),

    /// Whole-process memory ceiling tripped
    #[error(
        "memory limit exceeded: {:.2}MB > {:.2}MB",
        *used_bytes as f64 / 1_048_576.0,
        *limit_bytes as f64 / 1_048_576.0
    )]
    MemoryLimitExceeded {
        /// Current process memory in bytes
        used_bytes: u64,
        /// Configured ceiling in bytes
        limit_bytes: u64,
    },

    /// Guarded invocation ran out of time on its final attempt
    #[error("plugin {plugin} timed out after {attempts} attempt(s)")]
    ExecutionTimeout {
        /// Plugin whose invocation timed out
        plugin: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Guarded invocation exhausted its retries
    #[error("plugin {plugin} failed after {attempts} attempt(s): {message}")]
    ExecutionFailed {
        /// Plugin whose invocation failed
        plugin: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Message of the last attempt's error
        message: String,
    },

    /// Circuit breaker is open; isolated execution refused
    #[error("plugin {0} has exceeded its maximum error count")]
    CircuitOpen(String),

    /// Persisted config rejected by its schema
    #[error("invalid plugin config: {0}")]
    ConfigValidation(String),

    /// Plugin bundle could not be loaded (entry resolution, load hook)
    #[error("failed to load plugin: {0}")]
    PluginLoad(String),

    /// Failure raised inside plugin code (hooks, action handlers)
    #[error("plugin error: {0}")]
    Plugin(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
