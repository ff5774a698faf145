//! Definition registry: stores and retrieves workflow definitions
//!
//! Definitions are immutable once registered; only their status changes.
//! Definitions that fail validation are never stored.

use dashmap::DashMap;
use std::sync::Arc;
use workflow_types::{
    WorkflowDefinition, WorkflowError, WorkflowId, WorkflowResult, WorkflowStatus,
};

/// Registry of workflow definitions
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    definitions: DashMap<WorkflowId, Arc<WorkflowDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition as `Active`
    pub fn register(&self, mut definition: WorkflowDefinition) -> WorkflowResult<WorkflowId> {
        definition.validate()?;

        let id = definition.id.clone();
        if self.definitions.contains_key(&id) {
            return Err(WorkflowError::DuplicateWorkflow(id));
        }
        definition.status = WorkflowStatus::Active;

        tracing::info!(workflow_id = %id, name = %definition.name, "Workflow registered");
        self.definitions.insert(id.clone(), Arc::new(definition));
        Ok(id)
    }

    pub fn get(&self, id: &WorkflowId) -> WorkflowResult<Arc<WorkflowDefinition>> {
        self.definitions
            .get(id)
            .map(|def| Arc::clone(def.value()))
            .ok_or_else(|| WorkflowError::WorkflowNotFound(id.clone()))
    }

    /// Latest registered definition with `name`
    pub fn get_by_name(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .iter()
            .filter(|def| def.name == name)
            .max_by_key(|def| def.created_at)
            .map(|def| Arc::clone(def.value()))
    }

    pub fn set_status(&self, id: &WorkflowId, status: WorkflowStatus) -> WorkflowResult<()> {
        let mut entry = self
            .definitions
            .get_mut(id)
            .ok_or_else(|| WorkflowError::WorkflowNotFound(id.clone()))?;

        let mut updated = WorkflowDefinition::clone(entry.value());
        updated.status = status;
        *entry.value_mut() = Arc::new(updated);

        tracing::info!(workflow_id = %id, ?status, "Workflow status changed");
        Ok(())
    }

    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut list: Vec<_> = self
            .definitions
            .iter()
            .map(|def| Arc::clone(def.value()))
            .collect();
        list.sort_by_key(|def| def.created_at);
        list
    }

    pub fn count(&self) -> usize {
        self.definitions.len()
    }

    pub fn contains(&self, id: &WorkflowId) -> bool {
        self.definitions.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_types::{StateDefinition, TransitionDefinition};

    fn make_valid_definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(name)
            .with_state(StateDefinition::new("start"))
            .with_state(StateDefinition::new("end").final_state())
            .with_transition(TransitionDefinition::new("start", "end"))
            .with_initial_state("start")
    }

    #[test]
    fn test_register_and_get() {
        let registry = DefinitionRegistry::new();
        let id = registry.register(make_valid_definition("Test Workflow")).unwrap();

        let retrieved = registry.get(&id).unwrap();
        assert_eq!(retrieved.name, "Test Workflow");
        assert_eq!(retrieved.status, WorkflowStatus::Active);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_invalid() {
        let registry = DefinitionRegistry::new();
        let def = make_valid_definition("Bad")
            .with_transition(TransitionDefinition::new("start", "nowhere"));
        let id = def.id.clone();

        assert!(matches!(
            registry.register(def),
            Err(WorkflowError::InvalidWorkflow(_))
        ));
        assert_eq!(registry.count(), 0);
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_register_duplicate_id() {
        let registry = DefinitionRegistry::new();
        let def = make_valid_definition("Twice");
        let copy = def.clone();
        registry.register(def).unwrap();
        assert!(matches!(
            registry.register(copy),
            Err(WorkflowError::DuplicateWorkflow(_))
        ));
    }

    #[test]
    fn test_get_by_name() {
        let registry = DefinitionRegistry::new();
        registry.register(make_valid_definition("Review")).unwrap();
        assert!(registry.get_by_name("Review").is_some());
        assert!(registry.get_by_name("Nonexistent").is_none());
    }

    #[test]
    fn test_set_status() {
        let registry = DefinitionRegistry::new();
        let id = registry.register(make_valid_definition("A")).unwrap();
        registry.set_status(&id, WorkflowStatus::Deprecated).unwrap();
        assert_eq!(registry.get(&id).unwrap().status, WorkflowStatus::Deprecated);
    }

    #[test]
    fn test_get_nonexistent() {
        let registry = DefinitionRegistry::new();
        let result = registry.get(&WorkflowId::new("nonexistent"));
        assert!(matches!(result, Err(WorkflowError::WorkflowNotFound(_))));
    }
}
