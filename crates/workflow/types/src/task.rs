//! Tasks: units of work that gate workflow progress

use crate::{InstanceId, TaskId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Approval,
    Review,
    Validation,
    Manual,
    System,
    Notification,
    Escalation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl TaskStatus {
    /// Pending or in progress
    pub fn is_open(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A unit of work spawned while an instance occupies a state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub instance_id: InstanceId,
    pub workflow_id: WorkflowId,
    /// The state whose entry created this task
    pub state: String,
    pub name: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        instance_id: InstanceId,
        workflow_id: WorkflowId,
        state: impl Into<String>,
        name: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            instance_id,
            workflow_id,
            state: state.into(),
            name: name.into(),
            task_type,
            status: TaskStatus::Pending,
            assignee: None,
            priority: TaskPriority::Normal,
            data: Map::new(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            due_at: None,
            completed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && self.due_at.is_some_and(|due| due <= now)
    }

    /// Merge a result into the task data.
    ///
    /// Object results are merged key by key; anything else is stored under
    /// the `result` key.
    pub fn merge_result(&mut self, result: Value) {
        match &result {
            Value::Object(fields) => {
                for (key, value) in fields {
                    self.data.insert(key.clone(), value.clone());
                }
            }
            Value::Null => {}
            other => {
                self.data.insert("result".into(), other.clone());
            }
        }
        self.result = Some(result);
    }

    pub fn finish(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.completed_at = Some(now);
    }
}
