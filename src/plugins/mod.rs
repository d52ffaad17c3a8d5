//! Plugin system for the Deck host
//!
//! Plugins are discovered as bundles (`<plugin root>/<name>/plugin.json`),
//! held to their declared manifest, and dispatched through a per-plugin
//! execution guard. Plugin code is late-bound through an entry table rather
//! than dynamically loaded modules; the contract is the [`Plugin`] trait's
//! four optional hooks.

pub mod instance;
pub mod manifest;
pub mod registry;

pub use instance::{EntryTable, Plugin, PluginContext, PluginFactory};
pub use manifest::{ActionDecl, MANIFEST_FILE, Manifest};
pub use registry::{GuardLimits, PluginRecord, PluginRegistry, PluginSummary};
