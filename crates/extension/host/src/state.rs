use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Lifecycle state of a loaded extension
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionState {
    Loaded,
    Enabled,
    Disabled,
    Error,
    Installing,
    Updating,
    Uninstalling,
}

/// Public snapshot of a loaded extension
#[derive(Clone, Debug, Serialize)]
pub struct ExtensionInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub publisher: String,
    pub state: ExtensionState,
    pub dependencies: Vec<String>,
    pub hooks: Vec<String>,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ExtensionStats {
    pub total: usize,
    pub by_state: BTreeMap<ExtensionState, usize>,
    pub hook_points: usize,
    pub registered_objects: usize,
}

impl ExtensionStats {
    pub fn count(&self, state: ExtensionState) -> usize {
        self.by_state.get(&state).copied().unwrap_or(0)
    }
}

/// Outcome of enabling every loaded extension in dependency order
#[derive(Clone, Debug, Default)]
pub struct InitializationReport {
    pub enabled: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// A successful hook handler result
#[derive(Clone, Debug)]
pub struct HookResult {
    pub extension_id: String,
    pub value: serde_json::Value,
}
