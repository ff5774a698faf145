//! Workflow definitions: immutable state-machine blueprints
//!
//! A definition is a list of named states, the transitions between them and
//! the initial state. Definitions are validated structurally when they are
//! registered and are never modified afterwards, except for their status.

use crate::{StepAction, TaskPriority, TaskType, TransitionCondition, WorkflowError, WorkflowId, WorkflowResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

// ── Workflow Status ──────────────────────────────────────────────────

/// Availability of a definition for new instances
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Inactive,
    Deprecated,
    #[default]
    Draft,
}

// ── Task Templates ───────────────────────────────────────────────────

/// A task created each time the owning state is entered
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    /// Relative deadline, measured from task creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_in: Option<Duration>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl TaskTemplate {
    pub fn new(name: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            name: name.into(),
            task_type,
            assignee: None,
            priority: TaskPriority::Normal,
            due_in: None,
            data: serde_json::Map::new(),
        }
    }

    pub fn assigned_to(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn due_in(mut self, due_in: Duration) -> Self {
        self.due_in = Some(due_in);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// ── States ───────────────────────────────────────────────────────────

/// A named state
#[derive(Clone, Serialize, Deserialize)]
pub struct StateDefinition {
    pub name: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskTemplate>,
    /// Runs first on entry, before tasks are created
    #[serde(skip)]
    pub on_entry: Option<Arc<dyn StepAction>>,
    /// Runs on entry after tasks are created
    #[serde(skip)]
    pub action: Option<Arc<dyn StepAction>>,
}

impl StateDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_final: false,
            description: None,
            tasks: Vec::new(),
            on_entry: None,
            action: None,
        }
    }

    /// Mark the state as final: entering it completes the instance
    pub fn final_state(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_task(mut self, task: TaskTemplate) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn on_entry(mut self, hook: Arc<dyn StepAction>) -> Self {
        self.on_entry = Some(hook);
        self
    }

    pub fn with_action(mut self, action: Arc<dyn StepAction>) -> Self {
        self.action = Some(action);
        self
    }
}

impl std::fmt::Debug for StateDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDefinition")
            .field("name", &self.name)
            .field("is_final", &self.is_final)
            .field("tasks", &self.tasks)
            .field("on_entry", &self.on_entry.is_some())
            .field("action", &self.action.is_some())
            .finish()
    }
}

// ── Transitions ──────────────────────────────────────────────────────

/// A transition between two states.
///
/// The guard passes when the condition (if any) returns true and, when a
/// timeout is declared, that much time has elapsed since the source state
/// was last entered. A transition with neither fires immediately.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(skip)]
    pub condition: Option<Arc<dyn TransitionCondition>>,
    #[serde(skip)]
    pub action: Option<Arc<dyn StepAction>>,
}

impl TransitionDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            name: None,
            timeout: None,
            condition: None,
            action: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn TransitionCondition>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_action(mut self, action: Arc<dyn StepAction>) -> Self {
        self.action = Some(action);
        self
    }

    /// Human-readable label used in history and logs
    pub fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{} -> {}", self.from, self.to))
    }
}

impl std::fmt::Debug for TransitionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionDefinition")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("timeout", &self.timeout)
            .field("condition", &self.condition.is_some())
            .field("action", &self.action.is_some())
            .finish()
    }
}

// ── Workflow Definition ──────────────────────────────────────────────

/// A workflow definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub states: Vec<StateDefinition>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    pub initial_state: String,
    #[serde(default)]
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::generate(),
            name: name.into(),
            description: None,
            states: Vec::new(),
            transitions: Vec::new(),
            initial_state: String::new(),
            status: WorkflowStatus::Draft,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: WorkflowId) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_state(mut self, state: StateDefinition) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_transition(mut self, transition: TransitionDefinition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = state.into();
        self
    }

    pub fn state(&self, name: &str) -> WorkflowResult<&StateDefinition> {
        self.states
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| WorkflowError::StateNotFound(name.to_string()))
    }

    /// Outgoing transitions of `state`, in declaration order
    pub fn transitions_from<'a>(
        &'a self,
        state: &'a str,
    ) -> impl Iterator<Item = &'a TransitionDefinition> + 'a {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    /// Structural validation.
    ///
    /// Requires a name, at least one state, unique state names, an initial
    /// state that is declared, and transitions whose endpoints are declared.
    pub fn validate(&self) -> WorkflowResult<()> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::InvalidWorkflow("name is required".into()));
        }
        if self.states.is_empty() {
            return Err(WorkflowError::InvalidWorkflow(
                "at least one state is required".into(),
            ));
        }

        let mut names = HashSet::new();
        for state in &self.states {
            if state.name.trim().is_empty() {
                return Err(WorkflowError::InvalidWorkflow("state name is required".into()));
            }
            if !names.insert(state.name.as_str()) {
                return Err(WorkflowError::InvalidWorkflow(format!(
                    "duplicate state '{}'",
                    state.name
                )));
            }
        }

        if self.initial_state.is_empty() {
            return Err(WorkflowError::InvalidWorkflow(
                "initial state is required".into(),
            ));
        }
        if !names.contains(self.initial_state.as_str()) {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "initial state '{}' is not a declared state",
                self.initial_state
            )));
        }

        for transition in &self.transitions {
            for endpoint in [&transition.from, &transition.to] {
                if !names.contains(endpoint.as_str()) {
                    return Err(WorkflowError::InvalidWorkflow(format!(
                        "transition {} references undeclared state '{}'",
                        transition.label(),
                        endpoint
                    )));
                }
            }
        }

        Ok(())
    }
}
