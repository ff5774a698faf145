use crate::{InstanceId, InstanceStatus, TaskStatus, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A failed instance and the message it recorded
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceFailure {
    pub instance_id: InstanceId,
    pub workflow_id: WorkflowId,
    pub error: String,
}

/// Engine-wide counters
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub workflows: usize,
    pub instances_by_status: BTreeMap<InstanceStatus, usize>,
    pub tasks_by_status: BTreeMap<TaskStatus, usize>,
    pub failures: Vec<InstanceFailure>,
}

impl WorkflowStats {
    pub fn instances(&self, status: InstanceStatus) -> usize {
        self.instances_by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn tasks(&self, status: TaskStatus) -> usize {
        self.tasks_by_status.get(&status).copied().unwrap_or(0)
    }
}
