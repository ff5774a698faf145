//! The capability interface extension modules implement

use crate::{ExtensionContext, ExtensionManifest};
use arbor_types::SessionRef;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A hook invocation handed to an extension
#[derive(Clone, Copy, Debug)]
pub struct HookInvocation<'a> {
    pub point: &'a str,
    pub payload: &'a Value,
    pub session: Option<&'a SessionRef>,
}

/// An extension module.
///
/// Modules are produced by factories registered with the manager, keyed by
/// the manifest entry point (or the extension id).
#[async_trait]
pub trait Extension: Send + Sync {
    async fn activate(&self, context: Arc<ExtensionContext>) -> anyhow::Result<()>;

    async fn deactivate(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs on uninstall when the manifest sets `uninstallScript`
    async fn uninstall(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_hook(&self, _invocation: HookInvocation<'_>) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }
}

/// Builds an extension module from its manifest
pub type ExtensionFactory =
    Arc<dyn Fn(&ExtensionManifest) -> anyhow::Result<Arc<dyn Extension>> + Send + Sync>;
