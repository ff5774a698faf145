//! Transition evaluator: picks the transition that fires next
//!
//! Evaluation has no side effects of its own. Conditions are user code and
//! may fail; a failure is returned to the caller, which fails the instance.

use chrono::{DateTime, Utc};
use workflow_types::{
    InstanceView, Task, TransitionDefinition, WorkflowDefinition, WorkflowInstance,
};

/// Outcome of evaluating the current state
#[derive(Debug)]
pub enum NextStep<'a> {
    /// The current state is final
    Finished,
    /// No transition guard passes yet
    Blocked,
    Fire(&'a TransitionDefinition),
}

#[derive(Clone, Debug, Default)]
pub struct TransitionEvaluator;

impl TransitionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Decide what happens next for `instance`.
    ///
    /// Final states finish the instance. Otherwise the first outgoing
    /// transition in declaration order whose guard passes fires. Tasks only
    /// hold the instance through a guard such as [`tasks_resolved`].
    ///
    /// [`tasks_resolved`]: workflow_types::tasks_resolved
    pub async fn next_step<'a>(
        &self,
        definition: &'a WorkflowDefinition,
        instance: &WorkflowInstance,
        tasks: &[Task],
        now: DateTime<Utc>,
    ) -> anyhow::Result<NextStep<'a>> {
        let state = definition.state(&instance.current_state)?;
        if state.is_final {
            return Ok(NextStep::Finished);
        }

        let entered_at = instance.last_entered_at(&state.name);
        let view = InstanceView {
            instance,
            tasks,
            now,
        };
        for transition in definition.transitions_from(&state.name) {
            if self.guard_passes(transition, &view, entered_at).await? {
                return Ok(NextStep::Fire(transition));
            }
        }
        Ok(NextStep::Blocked)
    }

    async fn guard_passes(
        &self,
        transition: &TransitionDefinition,
        view: &InstanceView<'_>,
        entered_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        if let Some(timeout) = transition.timeout {
            let Some(entered_at) = entered_at else {
                return Ok(false);
            };
            let elapsed = (view.now - entered_at).to_std().unwrap_or_default();
            if elapsed < timeout {
                return Ok(false);
            }
        }

        match &transition.condition {
            Some(condition) => condition.evaluate(view).await,
            None => Ok(true),
        }
    }
}
