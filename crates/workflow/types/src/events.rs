use crate::{InstanceId, TaskId, WorkflowId};
use arbor_types::NamedEvent;
use serde::{Deserialize, Serialize};

/// Notifications published by the workflow engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowRegistered {
        workflow_id: WorkflowId,
        name: String,
    },
    WorkflowStarted {
        workflow_id: WorkflowId,
        instance_id: InstanceId,
    },
    StateEntered {
        instance_id: InstanceId,
        state: String,
    },
    WorkflowCompleted {
        instance_id: InstanceId,
    },
    WorkflowSuspended {
        instance_id: InstanceId,
    },
    WorkflowResumed {
        instance_id: InstanceId,
    },
    WorkflowCancelled {
        instance_id: InstanceId,
    },
    WorkflowError {
        instance_id: InstanceId,
        error: String,
    },
    TaskCreated {
        task_id: TaskId,
        instance_id: InstanceId,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskReassigned {
        task_id: TaskId,
        assignee: String,
    },
    TaskExpired {
        task_id: TaskId,
    },
}

impl NamedEvent for WorkflowEvent {
    fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowRegistered { .. } => "workflow_registered",
            WorkflowEvent::WorkflowStarted { .. } => "workflow_started",
            WorkflowEvent::StateEntered { .. } => "state_entered",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow_completed",
            WorkflowEvent::WorkflowSuspended { .. } => "workflow_suspended",
            WorkflowEvent::WorkflowResumed { .. } => "workflow_resumed",
            WorkflowEvent::WorkflowCancelled { .. } => "workflow_cancelled",
            WorkflowEvent::WorkflowError { .. } => "workflow_error",
            WorkflowEvent::TaskCreated { .. } => "task_created",
            WorkflowEvent::TaskStarted { .. } => "task_started",
            WorkflowEvent::TaskCompleted { .. } => "task_completed",
            WorkflowEvent::TaskFailed { .. } => "task_failed",
            WorkflowEvent::TaskReassigned { .. } => "task_reassigned",
            WorkflowEvent::TaskExpired { .. } => "task_expired",
        }
    }
}
