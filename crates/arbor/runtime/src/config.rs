//! Runtime configuration

use extension_host::ExtensionHostConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use workflow_engine::EngineConfig;

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub extensions: ExtensionHostConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,
}

/// Session lifetime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which the reaper ends a session
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,

    /// Interval between idle-session sweeps
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

/// Data layer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Database holding the tenant table
    #[serde(default = "default_system_database")]
    pub system_database: String,

    /// How long an advisory lock request waits before giving up
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
}

impl DataConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            system_database: default_system_database(),
            lock_timeout_ms: default_lock_timeout(),
        }
    }
}

/// Workflow engine and housekeeping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// Interval between completed-instance cleanup sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Age after which finished instances are purged
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            cleanup_interval_secs: default_cleanup_interval(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_session_timeout() -> u64 {
    3600
}

fn default_reap_interval() -> u64 {
    1800
}

fn default_system_database() -> String {
    "arbor_system".to_string()
}

fn default_lock_timeout() -> u64 {
    5000
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_retention_hours() -> u64 {
    24
}
