//! User-supplied workflow callbacks
//!
//! State hooks and transition actions receive a [`StepContext`] with mutable
//! access to the instance variables. Transition conditions receive a
//! read-only [`InstanceView`]. Both are async traits; the `*_fn` helpers wrap
//! plain closures for the common synchronous case.

use crate::{InstanceId, Task, WorkflowId, WorkflowInstance};
use arbor_types::SessionRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Mutable view handed to state hooks and transition actions
pub struct StepContext<'a> {
    pub instance_id: &'a InstanceId,
    pub workflow_id: &'a WorkflowId,
    /// The state being entered, or the source state of a transition
    pub state: &'a str,
    pub session: Option<&'a SessionRef>,
    pub variables: &'a mut HashMap<String, Value>,
}

impl StepContext<'_> {
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }
}

/// Read-only view handed to transition conditions
pub struct InstanceView<'a> {
    pub instance: &'a WorkflowInstance,
    /// Every task the instance has spawned so far
    pub tasks: &'a [Task],
    pub now: DateTime<Utc>,
}

impl InstanceView<'_> {
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.instance.variables.get(name)
    }

    pub fn current_state(&self) -> &str {
        &self.instance.current_state
    }

    /// Tasks spawned while the instance occupied `state`
    pub fn tasks_in_state<'s>(&'s self, state: &'s str) -> impl Iterator<Item = &'s Task> + 's {
        self.tasks.iter().filter(move |task| task.state == state)
    }

    /// No task spawned in the current state is still Pending or InProgress
    pub fn current_tasks_resolved(&self) -> bool {
        !self
            .tasks_in_state(self.current_state())
            .any(|task| task.is_open())
    }
}

/// Work performed on state entry or when a transition fires
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()>;
}

/// Guard deciding whether a transition may fire
#[async_trait]
pub trait TransitionCondition: Send + Sync {
    async fn evaluate(&self, view: &InstanceView<'_>) -> anyhow::Result<bool>;
}

pub struct FnAction<F>(F);

#[async_trait]
impl<F> StepAction for FnAction<F>
where
    F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

pub struct FnCondition<F>(F);

#[async_trait]
impl<F> TransitionCondition for FnCondition<F>
where
    F: Fn(&InstanceView<'_>) -> bool + Send + Sync,
{
    async fn evaluate(&self, view: &InstanceView<'_>) -> anyhow::Result<bool> {
        Ok((self.0)(view))
    }
}

/// Wrap a synchronous closure as a [`StepAction`]
pub fn action_fn<F>(f: F) -> Arc<dyn StepAction>
where
    F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnAction(f))
}

/// Wrap a synchronous predicate as a [`TransitionCondition`]
pub fn condition_fn<F>(f: F) -> Arc<dyn TransitionCondition>
where
    F: Fn(&InstanceView<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(FnCondition(f))
}

/// Guard that holds a transition until every task spawned in the current
/// state is resolved
pub fn tasks_resolved() -> Arc<dyn TransitionCondition> {
    condition_fn(|view| view.current_tasks_resolved())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TaskStatus, TaskType};

    fn task(instance: &WorkflowInstance, state: &str, status: TaskStatus) -> Task {
        let mut task = Task::new(
            instance.id.clone(),
            instance.workflow_id.clone(),
            state,
            "Review",
            TaskType::Approval,
        );
        task.status = status;
        task
    }

    #[test]
    fn current_tasks_resolved_ignores_other_states() {
        let instance = WorkflowInstance::new(WorkflowId::new("w-1"), "review");
        let tasks = vec![
            task(&instance, "review", TaskStatus::Completed),
            task(&instance, "intake", TaskStatus::Pending),
        ];
        let view = InstanceView {
            instance: &instance,
            tasks: &tasks,
            now: Utc::now(),
        };
        assert!(view.current_tasks_resolved());

        let tasks = vec![task(&instance, "review", TaskStatus::InProgress)];
        let view = InstanceView {
            instance: &instance,
            tasks: &tasks,
            now: Utc::now(),
        };
        assert!(!view.current_tasks_resolved());
    }
}
