//! Arbor data connection contract.
//!
//! The runtime never talks to a storage engine directly. It goes through the
//! traits defined here:
//! - [`DataServer`]: database provisioning and connection factory
//! - [`DataConnection`]: statements, transactions and advisory locks scoped
//!   to one database
//! - [`Transaction`]: a handle that stages writes until commit and reports
//!   its terminal status to subscribers
//!
//! Statements are typed values ([`Statement`]) rather than SQL text; the
//! runtime only needs keyed rows, and dialects are a backend concern.
//!
//! [`memory::MemoryServer`] is the in-memory reference backend. It is
//! deterministic and suitable for development and testing.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
pub mod memory;
mod statement;
mod traits;
mod types;

pub use error::{DataError, DataResult};
pub use memory::MemoryServer;
pub use statement::{RecordSet, Row, Statement};
pub use traits::{DataConnection, DataServer, Transaction};
pub use types::{IsolationLevel, LockMode, TransactionStatus};
