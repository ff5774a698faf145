//! Error types for the Arbor runtime

use crate::{CompanyStatus, TenantStatus};
use arbor_data::DataError;
use arbor_types::{CompanyId, SessionId, SettingDecodeError, TenantId};
use extension_host::ExtensionError;
use thiserror::Error;
use workflow_types::WorkflowError;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Runtime errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Credentials were rejected; carries no detail on purpose
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Permission denied: {permission}")]
    PermissionDenied { permission: String },

    #[error("No company available for the session")]
    NoCompanyAvailable,

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {0} is closed")]
    SessionInactive(SessionId),

    #[error("Session {0} already has an active transaction")]
    TransactionAlreadyActive(SessionId),

    #[error("Session {0} has no active transaction")]
    NoActiveTransaction(SessionId),

    #[error("Session {0} cannot switch context while a transaction is active")]
    ContextSwitchDuringTransaction(SessionId),

    #[error("Company not found: {0}")]
    CompanyNotFound(CompanyId),

    #[error("Company {id} is {status:?}")]
    CompanyUnavailable { id: CompanyId, status: CompanyStatus },

    #[error("Company already registered: {0}")]
    DuplicateCompany(CompanyId),

    #[error("Database name already in use: {0}")]
    DuplicateDatabase(String),

    #[error("Company {0} is not initialized")]
    NotInitialized(CompanyId),

    #[error("Tenant not found: {0}")]
    TenantNotFound(TenantId),

    #[error("Tenant {id} is {status:?}")]
    TenantUnavailable { id: TenantId, status: TenantStatus },

    #[error("Tenant code already in use: {0}")]
    DuplicateTenantCode(String),

    #[error("Company {company} does not belong to tenant {tenant}")]
    TenantMismatch { company: CompanyId, tenant: TenantId },

    #[error("Failed to provision database {database}: {reason}")]
    ProvisioningError { database: String, reason: String },

    #[error("Invalid setting {key}: {source}")]
    InvalidSetting {
        key: String,
        #[source]
        source: SettingDecodeError,
    },

    #[error("Transaction error: {0}")]
    Transaction(#[source] DataError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Extension error: {0}")]
    Extension(#[from] ExtensionError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
