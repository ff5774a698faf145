//! Workflow Engine for Arbor
//!
//! Runs declarative state-machine definitions as long-lived instances.
//! Instances advance through transition rules and pause on tasks that
//! people or systems must resolve.
//!
//! # Architecture
//!
//! The [`WorkflowEngine`] composes specialized components:
//!
//! - [`DefinitionRegistry`]: stores validated workflow definitions
//! - [`TransitionEvaluator`]: decides whether an instance finishes, waits or
//!   fires a transition
//! - [`TaskManager`]: owns the tasks spawned on state entry
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use workflow_engine::WorkflowEngine;
//! use workflow_types::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let engine = WorkflowEngine::default();
//!
//! let definition = WorkflowDefinition::new("Document Review")
//!     .with_state(StateDefinition::new("draft"))
//!     .with_state(StateDefinition::new("published").final_state())
//!     .with_transition(TransitionDefinition::new("draft", "published"))
//!     .with_initial_state("draft");
//! let workflow_id = engine.register_workflow(definition).unwrap();
//!
//! let instance_id = engine
//!     .start_workflow(&workflow_id, HashMap::new(), None)
//!     .unwrap();
//! engine.execute_workflow(&instance_id).await.unwrap();
//!
//! let instance = engine.get_instance(&instance_id).unwrap();
//! assert_eq!(instance.status, InstanceStatus::Completed);
//! # }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod definition_registry;
pub mod engine;
pub mod task_manager;
pub mod transition_evaluator;

pub use config::EngineConfig;
pub use definition_registry::DefinitionRegistry;
pub use engine::WorkflowEngine;
pub use task_manager::TaskManager;
pub use transition_evaluator::{NextStep, TransitionEvaluator};
