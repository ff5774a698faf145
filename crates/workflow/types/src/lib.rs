//! Workflow Domain Types for Arbor
//!
//! Workflows are declarative state machines that drive long-running
//! business processes across sessions.
//!
//! # Key Concepts
//!
//! - **WorkflowDefinition**: an immutable blueprint of named states, the
//!   transitions between them and the initial state.
//! - **WorkflowInstance**: one running execution of a definition. It has
//!   exactly one current state and an ordered history of state entries and
//!   transitions.
//! - **Task**: a unit of human or system work spawned when an instance
//!   enters a state. A transition guarded by [`tasks_resolved`] holds the
//!   instance in that state until its tasks are resolved.
//! - **Callbacks**: state entry hooks, state actions, transition actions and
//!   transition conditions. These are user code and report failures through
//!   `anyhow::Result`; a failing callback fails the owning instance.

#![deny(unsafe_code)]

mod callbacks;
mod definition;
mod errors;
mod events;
mod ids;
mod instance;
mod stats;
mod task;

pub use callbacks::*;
pub use definition::*;
pub use errors::*;
pub use events::*;
pub use ids::*;
pub use instance::*;
pub use stats::*;
pub use task::*;
