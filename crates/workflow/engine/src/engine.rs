//! Workflow engine: the main entry point
//!
//! The engine registers definitions, starts instances and drives them
//! through their states. Execution is asynchronous: `start_workflow`
//! returns the instance id immediately and the execution loop runs on a
//! spawned task. Each instance has its own execution lock, so overlapping
//! runs (a resume racing a task completion) are serialized.

use crate::{DefinitionRegistry, EngineConfig, NextStep, TaskManager, TransitionEvaluator};
use arbor_types::{EventBus, SessionRef};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use workflow_types::*;

/// Result of one execution step
enum Progress {
    /// The instance moved to another state (or entered its first one)
    Advanced,
    /// Nothing can happen until something external changes
    Idle,
    /// The current state is final
    Finished,
}

/// The workflow engine
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    definitions: DefinitionRegistry,
    instances: DashMap<InstanceId, WorkflowInstance>,
    tasks: TaskManager,
    execution_locks: DashMap<InstanceId, Arc<Mutex<()>>>,
    evaluator: TransitionEvaluator,
    events: EventBus<WorkflowEvent>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let events = EventBus::with_capacity(config.event_capacity);
        Self {
            inner: Arc::new(EngineInner {
                config,
                definitions: DefinitionRegistry::new(),
                instances: DashMap::new(),
                tasks: TaskManager::new(),
                execution_locks: DashMap::new(),
                evaluator: TransitionEvaluator::new(),
                events,
            }),
        }
    }

    pub fn events(&self) -> &EventBus<WorkflowEvent> {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    // ── Definition Management ────────────────────────────────────────

    /// Validate and register a definition; it becomes `Active`
    pub fn register_workflow(&self, definition: WorkflowDefinition) -> WorkflowResult<WorkflowId> {
        let name = definition.name.clone();
        let id = self.inner.definitions.register(definition)?;
        self.inner.events.publish(WorkflowEvent::WorkflowRegistered {
            workflow_id: id.clone(),
            name,
        });
        Ok(id)
    }

    pub fn get_workflow(&self, id: &WorkflowId) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.inner.definitions.get(id)
    }

    pub fn get_workflow_by_name(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.definitions.get_by_name(name)
    }

    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.inner.definitions.list()
    }

    pub fn set_workflow_status(&self, id: &WorkflowId, status: WorkflowStatus) -> WorkflowResult<()> {
        self.inner.definitions.set_status(id, status)
    }

    // ── Instance Lifecycle ───────────────────────────────────────────

    /// Create a `Running` instance and schedule its execution.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_workflow(
        &self,
        workflow_id: &WorkflowId,
        variables: HashMap<String, Value>,
        session: Option<SessionRef>,
    ) -> WorkflowResult<InstanceId> {
        let definition = self.inner.definitions.get(workflow_id)?;
        if definition.status != WorkflowStatus::Active {
            return Err(WorkflowError::WorkflowNotActive {
                id: workflow_id.clone(),
                status: definition.status,
            });
        }

        let instance = WorkflowInstance::new(definition.id.clone(), definition.initial_state.clone())
            .with_variables(variables)
            .with_session(session);
        let instance_id = instance.id.clone();
        self.inner.instances.insert(instance_id.clone(), instance);

        tracing::info!(
            workflow_id = %workflow_id,
            instance_id = %instance_id,
            "Workflow instance started"
        );
        self.inner.events.publish(WorkflowEvent::WorkflowStarted {
            workflow_id: workflow_id.clone(),
            instance_id: instance_id.clone(),
        });

        self.schedule(instance_id.clone());
        Ok(instance_id)
    }

    /// Run the execution loop for an instance until it settles.
    ///
    /// Enters the initial state if it has not been entered yet, then keeps
    /// firing transitions until the instance completes, fails, or has to
    /// wait for tasks or conditions. Callback failures fail the instance
    /// rather than being returned.
    pub async fn execute_workflow(&self, instance_id: &InstanceId) -> WorkflowResult<()> {
        let lock = self.execution_lock(instance_id);
        let _guard = lock.lock().await;

        let workflow_id = self.get_instance(instance_id)?.workflow_id;
        let definition = self.inner.definitions.get(&workflow_id)?;

        for _ in 0..self.inner.config.max_steps_per_run {
            let Some(mut instance) = self.running_snapshot(instance_id) else {
                return Ok(());
            };

            match self.step(&definition, &mut instance).await {
                Ok(Progress::Advanced) => {
                    if !self.store(instance) {
                        return Ok(());
                    }
                }
                Ok(Progress::Idle) => {
                    self.store(instance);
                    return Ok(());
                }
                Ok(Progress::Finished) => {
                    instance.set_status(InstanceStatus::Completed);
                    if self.store(instance) {
                        tracing::info!(instance_id = %instance_id, "Workflow instance completed");
                        self.inner.events.publish(WorkflowEvent::WorkflowCompleted {
                            instance_id: instance_id.clone(),
                        });
                    }
                    return Ok(());
                }
                Err(err) => {
                    self.record_failure(instance, format!("{err:#}"));
                    return Ok(());
                }
            }
        }

        if let Some(instance) = self.running_snapshot(instance_id) {
            let message = format!(
                "exceeded {} state changes without settling",
                self.inner.config.max_steps_per_run
            );
            self.record_failure(instance, message);
        }
        Ok(())
    }

    /// Running → Suspended
    pub fn suspend_workflow(&self, instance_id: &InstanceId) -> WorkflowResult<()> {
        self.transition_instance(instance_id, "suspend", |status| {
            (status == InstanceStatus::Running).then_some(InstanceStatus::Suspended)
        })?;
        tracing::info!(instance_id = %instance_id, "Workflow instance suspended");
        self.inner.events.publish(WorkflowEvent::WorkflowSuspended {
            instance_id: instance_id.clone(),
        });
        Ok(())
    }

    /// Suspended → Running; schedules the execution loop again
    pub fn resume_workflow(&self, instance_id: &InstanceId) -> WorkflowResult<()> {
        self.transition_instance(instance_id, "resume", |status| {
            (status == InstanceStatus::Suspended).then_some(InstanceStatus::Running)
        })?;
        tracing::info!(instance_id = %instance_id, "Workflow instance resumed");
        self.inner.events.publish(WorkflowEvent::WorkflowResumed {
            instance_id: instance_id.clone(),
        });
        self.schedule(instance_id.clone());
        Ok(())
    }

    /// Cancel a running or suspended instance and every open task it spawned
    pub fn cancel_workflow(&self, instance_id: &InstanceId) -> WorkflowResult<()> {
        self.transition_instance(instance_id, "cancel", |status| {
            (!status.is_terminal()).then_some(InstanceStatus::Cancelled)
        })?;

        let cancelled = self.inner.tasks.cancel_for_instance(instance_id);
        tracing::info!(
            instance_id = %instance_id,
            cancelled_tasks = cancelled.len(),
            "Workflow instance cancelled"
        );
        self.inner.events.publish(WorkflowEvent::WorkflowCancelled {
            instance_id: instance_id.clone(),
        });
        Ok(())
    }

    /// Remove terminal instances that finished more than `older_than_hours` ago
    pub fn cleanup_completed_instances(&self, older_than_hours: u64) -> usize {
        let hours = i64::try_from(older_than_hours).unwrap_or(i64::MAX);
        let cutoff = Utc::now() - chrono::Duration::hours(hours.min(24 * 365 * 1000));

        let expired: Vec<InstanceId> = self
            .inner
            .instances
            .iter()
            .filter(|instance| instance.completed_at.is_some_and(|at| at < cutoff))
            .map(|instance| instance.id.clone())
            .collect();

        for id in &expired {
            self.inner.instances.remove(id);
            self.inner.execution_locks.remove(id);
        }

        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "Purged finished workflow instances");
        }
        expired.len()
    }

    // ── Tasks ────────────────────────────────────────────────────────

    pub fn start_task(&self, task_id: &TaskId) -> WorkflowResult<Task> {
        let task = self.inner.tasks.start(task_id)?;
        self.inner.events.publish(WorkflowEvent::TaskStarted {
            task_id: task_id.clone(),
        });
        Ok(task)
    }

    /// Complete a task and run its instance's execution loop before returning
    pub async fn complete_task(&self, task_id: &TaskId, result: Option<Value>) -> WorkflowResult<Task> {
        let task = self.inner.tasks.complete(task_id, result)?;
        tracing::info!(task_id = %task_id, instance_id = %task.instance_id, "Task completed");
        self.inner.events.publish(WorkflowEvent::TaskCompleted {
            task_id: task_id.clone(),
        });

        match self.execute_workflow(&task.instance_id).await {
            Err(WorkflowError::InstanceNotFound(_)) => {
                tracing::debug!(task_id = %task_id, "Completed task has no live instance");
            }
            other => other?,
        }
        Ok(task)
    }

    /// Fail a task; this fails its whole instance
    pub fn fail_task(
        &self,
        task_id: &TaskId,
        error: impl Into<String>,
        result: Option<Value>,
    ) -> WorkflowResult<Task> {
        let error = error.into();
        let task = self.inner.tasks.fail(task_id, &error, result)?;
        tracing::warn!(task_id = %task_id, instance_id = %task.instance_id, %error, "Task failed");
        self.inner.events.publish(WorkflowEvent::TaskFailed {
            task_id: task_id.clone(),
            error: error.clone(),
        });

        self.force_fail(
            &task.instance_id,
            format!("task '{}' failed: {}", task.name, error),
        );
        Ok(task)
    }

    pub fn reassign_task(&self, task_id: &TaskId, assignee: impl Into<String>) -> WorkflowResult<Task> {
        let assignee = assignee.into();
        let task = self.inner.tasks.reassign(task_id, &assignee)?;
        tracing::debug!(task_id = %task_id, %assignee, "Task reassigned");
        self.inner.events.publish(WorkflowEvent::TaskReassigned {
            task_id: task_id.clone(),
            assignee,
        });
        Ok(task)
    }

    /// Expire overdue tasks and reschedule the instances they were holding
    pub fn expire_overdue_tasks(&self) -> usize {
        let expired = self.inner.tasks.expire_overdue(Utc::now());

        let mut affected = HashSet::new();
        for task in &expired {
            tracing::info!(task_id = %task.id, instance_id = %task.instance_id, "Task expired");
            self.inner.events.publish(WorkflowEvent::TaskExpired {
                task_id: task.id.clone(),
            });
            affected.insert(task.instance_id.clone());
        }
        for instance_id in affected {
            if self.running_snapshot(&instance_id).is_some() {
                self.schedule(instance_id);
            }
        }
        expired.len()
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get_instance(&self, instance_id: &InstanceId) -> WorkflowResult<WorkflowInstance> {
        self.inner
            .instances
            .get(instance_id)
            .map(|instance| instance.clone())
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.clone()))
    }

    /// Instances of a workflow, oldest first; empty for unknown workflows
    pub fn get_workflow_instances(&self, workflow_id: &WorkflowId) -> Vec<WorkflowInstance> {
        let mut instances: Vec<WorkflowInstance> = self
            .inner
            .instances
            .iter()
            .filter(|instance| &instance.workflow_id == workflow_id)
            .map(|instance| instance.clone())
            .collect();
        instances.sort_by_key(|instance| instance.created_at);
        instances
    }

    pub fn get_task(&self, task_id: &TaskId) -> WorkflowResult<Task> {
        self.inner.tasks.get(task_id)
    }

    pub fn get_instance_tasks(&self, instance_id: &InstanceId) -> Vec<Task> {
        self.inner.tasks.for_instance(instance_id)
    }

    /// Open tasks assigned to `assignee`, highest priority first
    pub fn get_user_tasks(&self, assignee: &str) -> Vec<Task> {
        self.inner.tasks.for_assignee(assignee)
    }

    pub fn instance_count(&self) -> usize {
        self.inner.instances.len()
    }

    pub fn stats(&self) -> WorkflowStats {
        let mut instances_by_status = BTreeMap::new();
        let mut failures = Vec::new();
        for instance in self.inner.instances.iter() {
            *instances_by_status.entry(instance.status).or_insert(0) += 1;
            if instance.status == InstanceStatus::Failed {
                failures.push(InstanceFailure {
                    instance_id: instance.id.clone(),
                    workflow_id: instance.workflow_id.clone(),
                    error: instance.error.clone().unwrap_or_default(),
                });
            }
        }

        WorkflowStats {
            workflows: self.inner.definitions.count(),
            instances_by_status,
            tasks_by_status: self.inner.tasks.counts(),
            failures,
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn schedule(&self, instance_id: InstanceId) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.execute_workflow(&instance_id).await {
                tracing::error!(instance_id = %instance_id, error = %err, "Workflow execution failed");
            }
        });
    }

    fn execution_lock(&self, instance_id: &InstanceId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.inner
                .execution_locks
                .entry(instance_id.clone())
                .or_default()
                .value(),
        )
    }

    fn running_snapshot(&self, instance_id: &InstanceId) -> Option<WorkflowInstance> {
        self.inner
            .instances
            .get(instance_id)
            .filter(|instance| instance.is_running())
            .map(|instance| instance.clone())
    }

    /// Write back the result of a step.
    ///
    /// If the stored instance left `Running` while the step ran (suspended,
    /// cancelled or failed from outside), its status wins and only the
    /// progress made is kept. Returns whether the instance is still the
    /// engine's to drive.
    fn store(&self, instance: WorkflowInstance) -> bool {
        let Some(mut stored) = self.inner.instances.get_mut(&instance.id) else {
            return false;
        };
        if stored.is_running() {
            *stored = instance;
            return true;
        }
        stored.current_state = instance.current_state;
        stored.history = instance.history;
        stored.variables = instance.variables;
        stored.updated_at = Utc::now();
        false
    }

    fn record_failure(&self, mut instance: WorkflowInstance, message: String) {
        let instance_id = instance.id.clone();
        instance.fail(message.clone());
        if self.store(instance) {
            tracing::warn!(instance_id = %instance_id, error = %message, "Workflow instance failed");
            self.inner.events.publish(WorkflowEvent::WorkflowError {
                instance_id,
                error: message,
            });
        }
    }

    /// Fail a stored instance in any non-terminal status, suspended included
    fn force_fail(&self, instance_id: &InstanceId, message: String) {
        {
            let Some(mut stored) = self.inner.instances.get_mut(instance_id) else {
                return;
            };
            if stored.is_terminal() {
                return;
            }
            stored.fail(message.clone());
        }
        tracing::warn!(instance_id = %instance_id, error = %message, "Workflow instance failed");
        self.inner.events.publish(WorkflowEvent::WorkflowError {
            instance_id: instance_id.clone(),
            error: message,
        });
    }

    fn transition_instance(
        &self,
        instance_id: &InstanceId,
        operation: &'static str,
        next: impl FnOnce(InstanceStatus) -> Option<InstanceStatus>,
    ) -> WorkflowResult<()> {
        let mut instance = self
            .inner
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| WorkflowError::InstanceNotFound(instance_id.clone()))?;
        let status = instance.status;
        match next(status) {
            Some(target) => {
                instance.set_status(target);
                Ok(())
            }
            None => Err(WorkflowError::InvalidInstanceState {
                id: instance_id.clone(),
                status,
                operation,
            }),
        }
    }

    async fn step(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
    ) -> anyhow::Result<Progress> {
        if !instance.has_entered_current_state() {
            let initial = instance.current_state.clone();
            self.enter_state(definition, instance, &initial).await?;
            return Ok(Progress::Advanced);
        }

        let tasks = self.inner.tasks.for_instance(&instance.id);
        let next = self
            .inner
            .evaluator
            .next_step(definition, instance, &tasks, Utc::now())
            .await?;

        match next {
            NextStep::Finished => Ok(Progress::Finished),
            NextStep::Blocked => {
                tracing::debug!(
                    instance_id = %instance.id,
                    state = %instance.current_state,
                    "No transition guard passes"
                );
                Ok(Progress::Idle)
            }
            NextStep::Fire(transition) => {
                let from = instance.current_state.clone();
                if let Some(action) = &transition.action {
                    run_action(action.as_ref(), instance, &from).await?;
                }
                instance.record_transition(&from, &transition.to, transition.label());
                tracing::debug!(
                    instance_id = %instance.id,
                    from = %from,
                    to = %transition.to,
                    "Transition fired"
                );
                self.enter_state(definition, instance, &transition.to).await?;
                Ok(Progress::Advanced)
            }
        }
    }

    /// Enter a state: entry hook, task creation, state action, history entry
    async fn enter_state(
        &self,
        definition: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        name: &str,
    ) -> anyhow::Result<()> {
        let state = definition.state(name)?;
        instance.current_state = state.name.clone();

        if let Some(hook) = &state.on_entry {
            run_action(hook.as_ref(), instance, name).await?;
        }

        for template in &state.tasks {
            let task = self.inner.tasks.create(instance, template);
            self.inner.events.publish(WorkflowEvent::TaskCreated {
                task_id: task.id,
                instance_id: instance.id.clone(),
            });
        }

        if let Some(action) = &state.action {
            run_action(action.as_ref(), instance, name).await?;
        }

        instance.record_entry(name);
        tracing::debug!(instance_id = %instance.id, state = name, "State entered");
        self.inner.events.publish(WorkflowEvent::StateEntered {
            instance_id: instance.id.clone(),
            state: name.to_string(),
        });
        Ok(())
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.inner.definitions.count())
            .field("instances", &self.inner.instances.len())
            .field("tasks", &self.inner.tasks.count())
            .finish()
    }
}

async fn run_action(
    action: &dyn StepAction,
    instance: &mut WorkflowInstance,
    state: &str,
) -> anyhow::Result<()> {
    let mut ctx = StepContext {
        instance_id: &instance.id,
        workflow_id: &instance.workflow_id,
        state,
        session: instance.session.as_ref(),
        variables: &mut instance.variables,
    };
    action.run(&mut ctx).await
}
