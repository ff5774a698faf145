//! Shared domain types for the Arbor business runtime
//!
//! Every other Arbor crate builds on these:
//!
//! - **Identifiers**: [`TenantId`], [`CompanyId`], [`SessionId`], [`UserId`]
//! - **Identity**: [`User`], [`Credentials`], [`PermissionSet`]
//! - **Settings**: [`SettingValue`], the typed value stored in company and
//!   tenant settings tables
//! - **Session references**: [`SessionRef`], a detached snapshot of a session
//!   handed to subsystems that must not own sessions (extensions, workflows)
//! - **Events**: [`EventBus`], a broadcast channel wrapper used by every
//!   subsystem to publish lifecycle notifications

#![deny(unsafe_code)]

mod event_bus;
mod ids;
mod identity;
mod session_ref;
mod settings;

pub use event_bus::*;
pub use ids::*;
pub use identity::*;
pub use session_ref::*;
pub use settings::*;
