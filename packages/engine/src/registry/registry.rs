// packages/engine/src/registry/registry.rs
//! Concurrent agent registry
//!
//! Registration is an upsert: re-registering an identifier swaps the whole
//! descriptor under the write lock, so readers observe either the old or
//! the new record, never a mix. `list()` materializes a fresh snapshot in
//! first-registration order.

use crate::registry::descriptor::AgentDescriptor;
use crate::registry::loader::load_descriptor_dir;
use crate::utils::errors::{EngineError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Inserted,
    Replaced,
}

#[derive(Default)]
struct RegistryInner {
    /// Identifiers in first-registration order
    order: Vec<String>,
    items: HashMap<String, Arc<AgentDescriptor>>,
}

/// Identifier → descriptor map shared by the selector and registration paths
#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a descriptor after validating it
    pub fn register(&self, descriptor: AgentDescriptor) -> Result<Registration> {
        descriptor.validate()?;

        let id = descriptor.id.clone();
        let descriptor = Arc::new(descriptor);

        let outcome = {
            let mut inner = self.inner.write();
            match inner.items.insert(id.clone(), descriptor) {
                Some(_) => Registration::Replaced,
                None => {
                    inner.order.push(id.clone());
                    Registration::Inserted
                }
            }
        };

        debug!(agent_id = %id, ?outcome, "Registered agent");
        Ok(outcome)
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentDescriptor>> {
        self.inner.read().items.get(id).cloned()
    }

    /// Snapshot of all descriptors in first-registration order
    pub fn list(&self) -> Vec<Arc<AgentDescriptor>> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    pub fn deregister(&self, id: &str) -> Option<Arc<AgentDescriptor>> {
        let mut inner = self.inner.write();
        let removed = inner.items.remove(id)?;
        inner.order.retain(|existing| existing != id);
        drop(inner);

        debug!(agent_id = %id, "Deregistered agent");
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().items.is_empty()
    }

    /// Register every descriptor record in `dir`
    ///
    /// Fails on the first malformed or invalid record, naming its file.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let records = load_descriptor_dir(dir)?;
        let count = records.len();

        for (path, descriptor) in records {
            self.register(descriptor).map_err(|e| EngineError::DescriptorLoad {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        }

        info!("Loaded {} agent descriptors from {:?}", count, dir);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor::ReliabilityTier;
    use std::thread;

    #[test]
    fn test_register_and_get() {
        let registry = Registry::new();
        let outcome = registry
            .register(AgentDescriptor::new("ocr", ["vision.ocr"], "deploy/ocr"))
            .unwrap();
        assert_eq!(outcome, Registration::Inserted);

        let found = registry.get("ocr").unwrap();
        assert!(found.capabilities.contains("vision.ocr"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_register_rejects_invalid() {
        let registry = Registry::new();
        let result = registry.register(AgentDescriptor::new("", ["a"], "ref"));
        assert!(matches!(result, Err(EngineError::InvalidDescriptor { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_upsert_replaces_whole_record() {
        let registry = Registry::new();
        registry
            .register(AgentDescriptor::new("a1", ["x"], "v1"))
            .unwrap();
        let outcome = registry
            .register(AgentDescriptor::new("a1", ["y"], "v2").with_tier(ReliabilityTier::High))
            .unwrap();

        assert_eq!(outcome, Registration::Replaced);
        assert_eq!(registry.len(), 1);

        let current = registry.get("a1").unwrap();
        assert_eq!(current.deployment_ref, "v2");
        assert!(!current.capabilities.contains("x"));
    }

    #[test]
    fn test_list_is_stable_snapshot() {
        let registry = Registry::new();
        for id in ["c", "a", "b"] {
            registry.register(AgentDescriptor::new(id, ["cap"], "ref")).unwrap();
        }
        // replacing keeps the original position
        registry.register(AgentDescriptor::new("c", ["cap2"], "ref")).unwrap();

        let snapshot = registry.list();
        registry.register(AgentDescriptor::new("d", ["cap"], "ref")).unwrap();

        let ids: Vec<&str> = snapshot.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(registry.list().len(), 4);
    }

    #[test]
    fn test_deregister() {
        let registry = Registry::new();
        registry.register(AgentDescriptor::new("a", ["x"], "r")).unwrap();
        registry.register(AgentDescriptor::new("b", ["x"], "r")).unwrap();

        assert!(registry.deregister("a").is_some());
        assert!(registry.deregister("a").is_none());
        let ids: Vec<String> = registry.list().iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[test]
    fn test_readers_never_see_stale_after_reregister() {
        let registry = Arc::new(Registry::new());
        registry
            .register(AgentDescriptor::new("agent", ["x"], "gen-0"))
            .unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut last_seen = 0u32;
                    for _ in 0..2_000 {
                        let current = registry.get("agent").unwrap();
                        let generation: u32 = current
                            .deployment_ref
                            .trim_start_matches("gen-")
                            .parse()
                            .unwrap();
                        // generations only move forward for any single reader
                        assert!(generation >= last_seen);
                        last_seen = generation;
                    }
                })
            })
            .collect();

        for generation in 1..=200u32 {
            registry
                .register(AgentDescriptor::new("agent", ["x"], format!("gen-{}", generation)))
                .unwrap();
        }

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(registry.get("agent").unwrap().deployment_ref, "gen-200");
    }
}
