//! Registry of resource producers
//!
//! Producers are looked up on every enlistment and during recovery, and
//! registered rarely. Lookups share a read lock; registration takes the
//! write lock only to reserve and publish a name, never across a recovery
//! scan.

use crate::error::{CoordinatorError, Result};
use crate::recovery::Recoverer;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tandem_common::{BranchHandle, ResourceProducer, XaResource};

#[derive(Default)]
struct Registry {
    producers: HashMap<String, Arc<dyn ResourceProducer>>,
    /// Names reserved by registrations still running incremental recovery
    pending: HashSet<String>,
}

/// Name to resource producer registry
#[derive(Default)]
pub struct ResourceRegistrar {
    registry: RwLock<Registry>,
    recoverer: RwLock<Option<Weak<Recoverer>>>,
}

impl ResourceRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a producer under its unique name.
    ///
    /// While a coordinator is running, the producer's in-doubt branches are
    /// recovered before it becomes visible; a failed recovery fails the
    /// registration.
    pub async fn register(&self, producer: Arc<dyn ResourceProducer>) -> Result<()> {
        let name = producer.unique_name().to_string();
        if name.is_empty() {
            return Err(CoordinatorError::InvalidResource(
                "producer has an empty unique name".to_string(),
            ));
        }

        {
            let mut registry = self.registry.write();
            if registry.producers.contains_key(&name) || registry.pending.contains(&name) {
                return Err(CoordinatorError::AlreadyRegistered(name));
            }
            registry.pending.insert(name.clone());
        }

        let recoverer = self.recoverer.read().as_ref().and_then(Weak::upgrade);
        if let Some(recoverer) = recoverer
            && let Err(e) = recoverer.recover_producer(producer.clone()).await
        {
            self.registry.write().pending.remove(&name);
            tracing::warn!("Registration of {} failed: {}", name, e);
            return Err(e);
        }

        let mut registry = self.registry.write();
        registry.pending.remove(&name);
        registry.producers.insert(name.clone(), producer);
        tracing::info!("Registered resource producer {}", name);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn ResourceProducer>> {
        let producer = self
            .registry
            .write()
            .producers
            .remove(name)
            .ok_or_else(|| CoordinatorError::NotRegistered(name.to_string()))?;
        tracing::info!("Unregistered resource producer {}", name);
        Ok(producer)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ResourceProducer>> {
        self.registry.read().producers.get(name).cloned()
    }

    /// Find the branch handle of a live resource instance among all producers.
    pub fn find_branch_handle(&self, resource: &Arc<dyn XaResource>) -> Option<BranchHandle> {
        self.registry
            .read()
            .producers
            .values()
            .find_map(|producer| producer.find_branch_handle(resource))
    }

    pub fn unique_names(&self) -> BTreeSet<String> {
        self.registry.read().producers.keys().cloned().collect()
    }

    /// Registered producers, ordered by name.
    pub fn producers(&self) -> Vec<Arc<dyn ResourceProducer>> {
        let registry = self.registry.read();
        let mut producers: Vec<_> = registry.producers.values().cloned().collect();
        producers.sort_by(|a, b| a.unique_name().cmp(b.unique_name()));
        producers
    }

    /// Drop every registered producer.
    pub fn clear(&self) {
        let mut registry = self.registry.write();
        registry.producers.clear();
        registry.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.registry.read().producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().producers.is_empty()
    }

    pub(crate) fn attach_recoverer(&self, recoverer: &Arc<Recoverer>) {
        *self.recoverer.write() = Some(Arc::downgrade(recoverer));
    }

    pub(crate) fn detach_recoverer(&self) {
        *self.recoverer.write() = None;
    }
}
