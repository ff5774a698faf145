use arbor_types::NamedEvent;
use serde::Serialize;

/// Notifications published by the extension manager
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExtensionEvent {
    ExtensionLoaded { id: String, version: String },
    ExtensionEnabled { id: String },
    ExtensionDisabled { id: String },
    ExtensionInstalled { id: String },
    ExtensionUpdated { id: String, from: String, to: String },
    ExtensionUninstalled { id: String },
    ExtensionFailed { id: String, error: String },
    HookError { point: String, id: String, error: String },
}

impl NamedEvent for ExtensionEvent {
    fn name(&self) -> &'static str {
        match self {
            ExtensionEvent::ExtensionLoaded { .. } => "extension_loaded",
            ExtensionEvent::ExtensionEnabled { .. } => "extension_enabled",
            ExtensionEvent::ExtensionDisabled { .. } => "extension_disabled",
            ExtensionEvent::ExtensionInstalled { .. } => "extension_installed",
            ExtensionEvent::ExtensionUpdated { .. } => "extension_updated",
            ExtensionEvent::ExtensionUninstalled { .. } => "extension_uninstalled",
            ExtensionEvent::ExtensionFailed { .. } => "extension_failed",
            ExtensionEvent::HookError { .. } => "hook_error",
        }
    }
}
