//! Arbor runtime
//!
//! Multi-tenant business runtime. Tenants own databases and companies,
//! companies own databases and settings, and sessions bind a user to one
//! company (and optionally one tenant) with their own transaction, locks
//! and variables.
//!
//! The [`Application`] coordinator is the entry point: it authenticates
//! users through an [`AuthorizationOracle`], opens and reaps sessions, and
//! owns the extension manager and workflow engine.

#![deny(unsafe_code)]

mod application;
mod auth;
mod company;
mod config;
mod error;
mod events;
mod records;
mod session;
mod tenant;
mod tenant_registry;

pub use application::{Application, IMPERSONATE_PERMISSION};
pub use auth::{AuthorizationOracle, StaticAuthorizer};
pub use company::{
    Company, CompanyConfig, CompanyRecord, CompanySettings, CompanyStatus, SETTINGS_TABLE,
};
pub use config::{DataConfig, RuntimeConfig, SessionConfig, WorkflowConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use events::{CompanyEvent, RuntimeEvents, SessionEvent, TenantEvent};
pub use records::database_name;
pub use session::{LockInfo, Session, SessionObserver, WeakSession};
pub use tenant::{Tenant, TenantConfig, TenantRecord, TenantStatus, COMPANIES_TABLE};
pub use tenant_registry::{TenantRegistry, TENANTS_TABLE};
