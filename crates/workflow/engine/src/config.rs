use serde::{Deserialize, Serialize};

/// Workflow engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on state changes in one execution run; an instance that
    /// keeps transitioning past it is failed
    #[serde(default = "default_max_steps_per_run")]
    pub max_steps_per_run: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_steps_per_run() -> usize {
    1000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_run: default_max_steps_per_run(),
            event_capacity: default_event_capacity(),
        }
    }
}
