//! Task manager: owns every task spawned by workflow instances

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use workflow_types::{
    InstanceId, Task, TaskId, TaskStatus, TaskTemplate, WorkflowError, WorkflowInstance,
    WorkflowResult,
};

#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: DashMap<TaskId, Task>,
    by_instance: DashMap<InstanceId, Vec<TaskId>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `Pending` task for `instance` in its current state
    pub fn create(&self, instance: &WorkflowInstance, template: &TaskTemplate) -> Task {
        let mut task = Task::new(
            instance.id.clone(),
            instance.workflow_id.clone(),
            instance.current_state.clone(),
            template.name.clone(),
            template.task_type,
        );
        task.assignee = template.assignee.clone();
        task.priority = template.priority;
        task.data = template.data.clone();
        task.due_at = template
            .due_in
            .and_then(|due_in| chrono::Duration::from_std(due_in).ok())
            .map(|due_in| task.created_at + due_in);

        self.by_instance
            .entry(instance.id.clone())
            .or_default()
            .push(task.id.clone());
        self.tasks.insert(task.id.clone(), task.clone());

        tracing::debug!(
            task_id = %task.id,
            instance_id = %task.instance_id,
            state = %task.state,
            "Task created"
        );
        task
    }

    pub fn get(&self, id: &TaskId) -> WorkflowResult<Task> {
        self.tasks
            .get(id)
            .map(|task| task.clone())
            .ok_or_else(|| WorkflowError::TaskNotFound(id.clone()))
    }

    /// Pending → InProgress
    pub fn start(&self, id: &TaskId) -> WorkflowResult<Task> {
        self.update(id, "start", |task| {
            if task.status != TaskStatus::Pending {
                return false;
            }
            task.status = TaskStatus::InProgress;
            task.updated_at = Utc::now();
            true
        })
    }

    pub fn complete(&self, id: &TaskId, result: Option<Value>) -> WorkflowResult<Task> {
        self.update(id, "complete", |task| {
            if !task.is_open() {
                return false;
            }
            if let Some(result) = result {
                task.merge_result(result);
            }
            task.finish(TaskStatus::Completed);
            true
        })
    }

    pub fn fail(&self, id: &TaskId, error: &str, result: Option<Value>) -> WorkflowResult<Task> {
        self.update(id, "fail", |task| {
            if !task.is_open() {
                return false;
            }
            if let Some(result) = result {
                task.merge_result(result);
            }
            task.error = Some(error.to_string());
            task.finish(TaskStatus::Failed);
            true
        })
    }

    pub fn reassign(&self, id: &TaskId, assignee: &str) -> WorkflowResult<Task> {
        self.update(id, "reassign", |task| {
            if !task.is_open() {
                return false;
            }
            task.assignee = Some(assignee.to_string());
            task.updated_at = Utc::now();
            true
        })
    }

    /// Cancel every open task of `instance`; returns the cancelled ids
    pub fn cancel_for_instance(&self, instance: &InstanceId) -> Vec<TaskId> {
        self.ids_for(instance)
            .into_iter()
            .filter(|id| {
                self.tasks.get_mut(id).is_some_and(|mut task| {
                    if task.is_open() {
                        task.finish(TaskStatus::Cancelled);
                        true
                    } else {
                        false
                    }
                })
            })
            .collect()
    }

    /// Expire every open task whose deadline has passed
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut expired = Vec::new();
        for mut task in self.tasks.iter_mut() {
            if task.is_overdue(now) {
                task.finish(TaskStatus::Expired);
                expired.push(task.clone());
            }
        }
        expired
    }

    /// Tasks of `instance`, in creation order
    pub fn for_instance(&self, instance: &InstanceId) -> Vec<Task> {
        self.ids_for(instance)
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|task| task.clone()))
            .collect()
    }

    /// Open tasks assigned to `assignee`, highest priority first
    pub fn for_assignee(&self, assignee: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|task| task.is_open() && task.assignee.as_deref() == Some(assignee))
            .map(|task| task.clone())
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        tasks
    }

    pub fn counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.tasks.iter() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }

    fn ids_for(&self, instance: &InstanceId) -> Vec<TaskId> {
        self.by_instance
            .get(instance)
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    fn update(
        &self,
        id: &TaskId,
        operation: &'static str,
        apply: impl FnOnce(&mut Task) -> bool,
    ) -> WorkflowResult<Task> {
        let mut task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| WorkflowError::TaskNotFound(id.clone()))?;
        if !apply(task.value_mut()) {
            return Err(WorkflowError::InvalidTaskState {
                id: id.clone(),
                status: task.status,
                operation,
            });
        }
        Ok(task.clone())
    }
}
