//! Registry of object types contributed by extensions

use crate::{ExtensionError, ExtensionResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
pub struct RegisteredObject {
    pub object_type: String,
    pub extension_id: String,
    pub definition: Value,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: DashMap<String, RegisteredObject>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) an object type owned by `extension_id`
    pub fn register(
        &self,
        extension_id: &str,
        object_type: &str,
        definition: Value,
    ) -> ExtensionResult<()> {
        let object = RegisteredObject {
            object_type: object_type.to_string(),
            extension_id: extension_id.to_string(),
            definition,
            registered_at: Utc::now(),
        };
        match self.objects.entry(object_type.to_string()) {
            Entry::Occupied(mut existing) => {
                if existing.get().extension_id != extension_id {
                    return Err(ExtensionError::ObjectConflict {
                        object_type: object_type.to_string(),
                        owner: existing.get().extension_id.clone(),
                    });
                }
                existing.insert(object);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(object);
            }
        }
        tracing::debug!(extension_id, object_type, "Object type registered");
        Ok(())
    }

    pub fn get(&self, object_type: &str) -> Option<RegisteredObject> {
        self.objects.get(object_type).map(|object| object.clone())
    }

    /// Object types registered by one extension, sorted
    pub fn owned_by(&self, extension_id: &str) -> Vec<String> {
        let mut types: Vec<String> = self
            .objects
            .iter()
            .filter(|object| object.extension_id == extension_id)
            .map(|object| object.object_type.clone())
            .collect();
        types.sort();
        types
    }

    /// Drop every object type registered by `extension_id`
    pub fn remove_owned_by(&self, extension_id: &str) -> usize {
        let before = self.objects.len();
        self.objects
            .retain(|_, object| object.extension_id != extension_id);
        before - self.objects.len()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
