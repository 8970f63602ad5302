//! Connection pool stand-in

use crate::manager::MockResourceManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tandem_common::{BranchHandle, ResourceProducer, XaError, XaResource, same_instance};

/// Producer handing out connections to one [`MockResourceManager`]
pub struct MockProducer {
    unique_name: String,
    rm: Arc<MockResourceManager>,
    use_tm_join: bool,
    ordering_position: i32,
    connections: Mutex<Vec<Arc<dyn XaResource>>>,
    recovery_failure: Mutex<Option<XaError>>,
    recoveries_started: AtomicUsize,
    recoveries_ended: AtomicUsize,
}

impl MockProducer {
    pub fn new(unique_name: impl Into<String>, rm: Arc<MockResourceManager>) -> Self {
        Self {
            unique_name: unique_name.into(),
            rm,
            use_tm_join: false,
            ordering_position: 0,
            connections: Mutex::new(Vec::new()),
            recovery_failure: Mutex::new(None),
            recoveries_started: AtomicUsize::new(0),
            recoveries_ended: AtomicUsize::new(0),
        }
    }

    pub fn with_tm_join(mut self, use_tm_join: bool) -> Self {
        self.use_tm_join = use_tm_join;
        self
    }

    pub fn with_ordering_position(mut self, position: i32) -> Self {
        self.ordering_position = position;
        self
    }

    pub fn manager(&self) -> &Arc<MockResourceManager> {
        &self.rm
    }

    /// Hand out a new connection.
    pub fn connection(&self) -> Arc<dyn XaResource> {
        let resource = self.rm.resource();
        self.connections.lock().push(resource.clone());
        resource
    }

    /// Make `start_recovery` fail with `error` until cleared.
    pub fn fail_recovery(&self, error: Option<XaError>) {
        *self.recovery_failure.lock() = error;
    }

    pub fn recoveries_started(&self) -> usize {
        self.recoveries_started.load(Ordering::SeqCst)
    }

    pub fn recoveries_ended(&self) -> usize {
        self.recoveries_ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceProducer for MockProducer {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    fn find_branch_handle(&self, resource: &Arc<dyn XaResource>) -> Option<BranchHandle> {
        self.connections
            .lock()
            .iter()
            .find(|candidate| same_instance(candidate, resource))
            .map(|candidate| {
                BranchHandle::new(self.unique_name.clone(), candidate.clone())
                    .with_tm_join(self.use_tm_join)
                    .with_ordering_position(self.ordering_position)
            })
    }

    async fn start_recovery(&self) -> Result<Arc<dyn XaResource>, XaError> {
        self.recoveries_started.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.recovery_failure.lock().clone() {
            return Err(error);
        }
        Ok(self.rm.resource())
    }

    async fn end_recovery(&self) -> Result<(), XaError> {
        self.recoveries_ended.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_branch_handle_by_instance() {
        let rm = MockResourceManager::new("db");
        let producer = MockProducer::new("orders", rm.clone()).with_tm_join(true);

        let connection = producer.connection();
        let handle = producer.find_branch_handle(&connection).unwrap();
        assert_eq!(handle.unique_name(), "orders");
        assert!(handle.use_tm_join());

        // Same resource manager, but not handed out by this producer
        let stranger = rm.resource();
        assert!(producer.find_branch_handle(&stranger).is_none());
    }
}
