use std::path::PathBuf;
use thiserror::Error;

/// Result type for extension host operations.
pub type ExtensionResult<T> = Result<T, ExtensionError>;

/// Extension host errors.
#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("no extension manifest at {0}")]
    ManifestMissing(PathBuf),

    #[error("invalid extension manifest: {0}")]
    ManifestInvalid(String),

    #[error("failed to load module for extension {id}: {reason}")]
    ModuleLoadError { id: String, reason: String },

    #[error("extension already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("extension not found: {0}")]
    NotFound(String),

    #[error("circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error("missing dependency: {dependency} (required by {extension})")]
    MissingDependency {
        extension: String,
        dependency: String,
    },

    #[error("activation of {id} failed: {reason}")]
    ActivationFailed { id: String, reason: String },

    #[error("deactivation of {id} failed: {reason}")]
    DeactivationFailed { id: String, reason: String },

    #[error("{id} is required by enabled extensions: {}", .dependents.join(", "))]
    HasEnabledDependents { id: String, dependents: Vec<String> },

    #[error("{id} is required by extensions: {}", .dependents.join(", "))]
    HasDependents { id: String, dependents: Vec<String> },

    #[error("update of {id} requires a newer version than {current} (got {requested})")]
    VersionNotNewer {
        id: String,
        current: String,
        requested: String,
    },

    #[error("object type {object_type} is already registered by {owner}")]
    ObjectConflict { object_type: String, owner: String },

    #[error("context of extension {0} has been disposed")]
    ContextDisposed(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
