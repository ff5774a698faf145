//! Workflow instances: running executions of workflow definitions
//!
//! An instance has exactly one current state and records every state entry
//! and transition in its history. `Running` is the only status from which
//! the engine makes forward progress.

use crate::{InstanceId, WorkflowId};
use arbor_types::SessionRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ── Instance Status ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Suspended,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

// ── History ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    StateEntered { state: String },
    Transition { from: String, to: String, label: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub event: HistoryEvent,
    pub at: DateTime<Utc>,
}

// ── Workflow Instance ────────────────────────────────────────────────

/// A running (or finished) execution of a workflow definition
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_id: WorkflowId,
    pub status: InstanceStatus,
    pub current_state: String,
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// The session that started the instance, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a `Running` instance positioned at `initial_state`, not yet entered
    pub fn new(workflow_id: WorkflowId, initial_state: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            workflow_id,
            status: InstanceStatus::Running,
            current_state: initial_state.into(),
            history: Vec::new(),
            variables: HashMap::new(),
            session: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_session(mut self, session: Option<SessionRef>) -> Self {
        self.session = session;
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the current state has been entered yet
    pub fn has_entered_current_state(&self) -> bool {
        self.last_entered_at(&self.current_state).is_some()
    }

    /// Time of the most recent entry into `state`
    pub fn last_entered_at(&self, state: &str) -> Option<DateTime<Utc>> {
        self.history.iter().rev().find_map(|entry| match &entry.event {
            HistoryEvent::StateEntered { state: entered } if entered == state => Some(entry.at),
            _ => None,
        })
    }

    pub fn record_entry(&mut self, state: impl Into<String>) {
        let state = state.into();
        let now = Utc::now();
        self.current_state = state.clone();
        self.history.push(HistoryEntry {
            event: HistoryEvent::StateEntered { state },
            at: now,
        });
        self.updated_at = now;
    }

    pub fn record_transition(&mut self, from: &str, to: &str, label: String) {
        let now = Utc::now();
        self.history.push(HistoryEntry {
            event: HistoryEvent::Transition {
                from: from.to_string(),
                to: to.to_string(),
                label,
            },
            at: now,
        });
        self.updated_at = now;
    }

    /// Move to a terminal or suspended status, stamping `completed_at` for terminal ones
    pub fn set_status(&mut self, status: InstanceStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        if status.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.set_status(InstanceStatus::Failed);
    }
}
