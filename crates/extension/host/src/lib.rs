//! Extension host for Arbor
//!
//! Loads extensions described by an `extension.json` manifest, activates
//! them in dependency order and dispatches hook points to the extensions
//! that registered for them.
//!
//! Extension code is supplied by factories registered with the
//! [`ExtensionManager`] under the manifest's entry point. Each enabled
//! extension receives an [`ExtensionContext`] with persisted secrets and
//! state maps, and may register business objects in the shared
//! [`ObjectRegistry`].

#![deny(unsafe_code)]

mod config;
mod context;
mod error;
mod events;
mod extension;
mod hooks;
mod manager;
mod manifest;
mod objects;
mod state;

pub use config::ExtensionHostConfig;
pub use context::ExtensionContext;
pub use error::{ExtensionError, ExtensionResult};
pub use events::ExtensionEvent;
pub use extension::{Extension, ExtensionFactory, HookInvocation};
pub use hooks::HookRegistry;
pub use manager::ExtensionManager;
pub use manifest::{manifest_path, ExtensionManifest, MANIFEST_FILE};
pub use objects::{ObjectRegistry, RegisteredObject};
pub use state::{ExtensionInfo, ExtensionState, ExtensionStats, HookResult, InitializationReport};
