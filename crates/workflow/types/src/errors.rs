//! Error types for the Workflow layer

use crate::{InstanceId, InstanceStatus, TaskId, TaskStatus, WorkflowId, WorkflowStatus};

/// Errors that can occur in Workflow operations
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow already registered: {0}")]
    DuplicateWorkflow(WorkflowId),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Workflow {id} is not active (status: {status:?})")]
    WorkflowNotActive { id: WorkflowId, status: WorkflowStatus },

    #[error("Workflow instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Cannot {operation} instance {id} in status {status:?}")]
    InvalidInstanceState {
        id: InstanceId,
        status: InstanceStatus,
        operation: &'static str,
    },

    #[error("State not found: {0}")]
    StateNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Cannot {operation} task {id} in status {status:?}")]
    InvalidTaskState {
        id: TaskId,
        status: TaskStatus,
        operation: &'static str,
    },
}

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;
