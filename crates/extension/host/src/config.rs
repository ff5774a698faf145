use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Extension host configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtensionHostConfig {
    /// Directory scanned for extensions at startup
    #[serde(default)]
    pub extensions_dir: Option<PathBuf>,
    /// Root of per-extension storage
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Enable every loaded extension at startup
    #[serde(default = "default_auto_enable")]
    pub auto_enable: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/extensions")
}

fn default_auto_enable() -> bool {
    true
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for ExtensionHostConfig {
    fn default() -> Self {
        Self {
            extensions_dir: None,
            storage_root: default_storage_root(),
            auto_enable: default_auto_enable(),
            event_capacity: default_event_capacity(),
        }
    }
}
