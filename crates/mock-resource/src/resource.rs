//! One connection to a mock resource manager

use crate::manager::MockResourceManager;
use async_trait::async_trait;
use std::sync::Arc;
use tandem_common::{EndFlag, StartFlag, Vote, XaError, XaResource, Xid};

/// A live resource instance bound to a [`MockResourceManager`]
pub struct MockXaResource {
    rm: Arc<MockResourceManager>,
}

impl MockXaResource {
    pub fn new(rm: Arc<MockResourceManager>) -> Self {
        Self { rm }
    }

    pub fn manager(&self) -> &Arc<MockResourceManager> {
        &self.rm
    }
}

#[async_trait]
impl XaResource for MockXaResource {
    fn resource_manager(&self) -> &str {
        self.rm.name()
    }

    async fn start(&self, xid: &Xid, flag: StartFlag) -> Result<(), XaError> {
        self.rm.start(xid, flag).await
    }

    async fn end(&self, xid: &Xid, flag: EndFlag) -> Result<(), XaError> {
        self.rm.end(xid, flag).await
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote, XaError> {
        self.rm.prepare(xid).await
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.rm.commit(xid, one_phase).await
    }

    async fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.rm.rollback(xid).await
    }

    async fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.rm.forget(xid).await
    }

    async fn recover(&self) -> Result<Vec<Xid>, XaError> {
        self.rm.recover().await
    }
}
