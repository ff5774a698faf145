//! Arbor daemon library
//!
//! Components for the `arbord` process:
//! - layered configuration (defaults, file, environment)
//! - the [`Server`] that hosts the runtime and applies bootstrap data

pub mod config;
pub mod error;
pub mod server;

pub use config::{BootstrapConfig, DaemonConfig, LoggingConfig, TenantSeed, UserSeed};
pub use error::{DaemonError, DaemonResult};
pub use server::Server;
