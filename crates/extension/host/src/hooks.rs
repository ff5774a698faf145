//! Hook-point registry
//!
//! Handlers are kept per hook point in registration order, which is the
//! order extensions were enabled in.

use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct HookRegistry {
    points: RwLock<HashMap<String, Vec<String>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, extension_id: &str, points: &[String]) {
        let mut registry = self.points.write();
        for point in points {
            let handlers = registry.entry(point.clone()).or_default();
            if !handlers.iter().any(|id| id == extension_id) {
                handlers.push(extension_id.to_string());
            }
        }
    }

    pub fn unregister(&self, extension_id: &str) {
        let mut registry = self.points.write();
        registry.retain(|_, handlers| {
            handlers.retain(|id| id != extension_id);
            !handlers.is_empty()
        });
    }

    /// Extension ids registered at `point`, in registration order
    pub fn handlers(&self, point: &str) -> Vec<String> {
        self.points.read().get(point).cloned().unwrap_or_default()
    }

    /// Number of hook points with at least one handler
    pub fn point_count(&self) -> usize {
        self.points.read().len()
    }
}
