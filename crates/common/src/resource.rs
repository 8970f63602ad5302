//! Resource traits that XA adapters must implement
//!
//! These traits define the boundary between the coordinator and the
//! resource-specific adapters (database and queue wrappers, connection
//! pools). The coordinator never owns a connection: it only holds the
//! shared resource handles the pooling layer hands out.

use crate::xa::{EndFlag, StartFlag, Vote, XaError};
use crate::xid::Xid;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// One live XA resource instance (typically bound to one pooled connection).
///
/// Every call may block on the network; the coordinator bounds each call
/// with its own timeout, so implementations do not need to.
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Name of the resource manager this instance talks to.
    fn resource_manager(&self) -> &str;

    /// Whether `other` talks to the same resource manager (xa `isSameRM`).
    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.resource_manager() == other.resource_manager()
    }

    /// Associate work with a branch.
    async fn start(&self, xid: &Xid, flag: StartFlag) -> Result<(), XaError>;

    /// Dissociate work from a branch.
    async fn end(&self, xid: &Xid, flag: EndFlag) -> Result<(), XaError>;

    /// Phase one: ask the resource manager to prepare the branch.
    async fn prepare(&self, xid: &Xid) -> Result<Vote, XaError>;

    /// Phase two: commit the branch. `one_phase` skips the prepare vote.
    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    /// Roll the branch back.
    async fn rollback(&self, xid: &Xid) -> Result<(), XaError>;

    /// Discard the resource manager's memory of a heuristically completed branch.
    async fn forget(&self, xid: &Xid) -> Result<(), XaError>;

    /// List branches that are prepared or heuristically completed.
    async fn recover(&self) -> Result<Vec<Xid>, XaError>;
}

/// Whether two handles point at the same live resource instance.
pub fn same_instance(a: &Arc<dyn XaResource>, b: &Arc<dyn XaResource>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// A live resource instance together with the producer it came from.
///
/// This is what gets enlisted in a transaction.
#[derive(Clone)]
pub struct BranchHandle {
    unique_name: String,
    resource: Arc<dyn XaResource>,
    use_tm_join: bool,
    ordering_position: i32,
}

impl BranchHandle {
    pub fn new(unique_name: impl Into<String>, resource: Arc<dyn XaResource>) -> Self {
        Self {
            unique_name: unique_name.into(),
            resource,
            use_tm_join: false,
            ordering_position: 0,
        }
    }

    /// Allow this handle to join an ended branch of the same resource manager.
    pub fn with_tm_join(mut self, use_tm_join: bool) -> Self {
        self.use_tm_join = use_tm_join;
        self
    }

    /// Position of the branch in prepare/commit order (lower goes first).
    pub fn with_ordering_position(mut self, position: i32) -> Self {
        self.ordering_position = position;
        self
    }

    /// Unique name of the producer owning the resource
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn resource(&self) -> &Arc<dyn XaResource> {
        &self.resource
    }

    pub fn use_tm_join(&self) -> bool {
        self.use_tm_join
    }

    pub fn ordering_position(&self) -> i32 {
        self.ordering_position
    }
}

impl fmt::Debug for BranchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchHandle")
            .field("unique_name", &self.unique_name)
            .field("resource_manager", &self.resource.resource_manager())
            .field("use_tm_join", &self.use_tm_join)
            .field("ordering_position", &self.ordering_position)
            .finish()
    }
}

/// A named source of XA resources (a connection pool or a broker client).
#[async_trait]
pub trait ResourceProducer: Send + Sync {
    /// Name under which the producer is registered and journaled.
    fn unique_name(&self) -> &str;

    /// Find the handle wrapping a live resource instance handed out by this producer.
    fn find_branch_handle(&self, resource: &Arc<dyn XaResource>) -> Option<BranchHandle>;

    /// Open a resource for a recovery scan.
    async fn start_recovery(&self) -> Result<Arc<dyn XaResource>, XaError>;

    /// Release whatever `start_recovery` acquired.
    async fn end_recovery(&self) -> Result<(), XaError> {
        Ok(())
    }
}
