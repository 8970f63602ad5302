//! Enlisted resource branches

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tandem_common::{BranchHandle, HeuristicOutcome, XaError, XaResource, Xid};
use thiserror::Error;

/// State of one branch as the coordinator tracks it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchState {
    Active,
    Suspended,
    Ended,
    Prepared,
    /// Voted read-only; takes no part in phase two
    ReadOnly,
    Committed,
    RolledBack,
    /// The resource manager completed the branch on its own
    Heuristic(HeuristicOutcome),
    /// The outcome of the last call is not known
    Unknown { reason: String },
}

impl BranchState {
    /// Whether nothing is left to do for this branch.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            BranchState::ReadOnly | BranchState::Committed | BranchState::RolledBack
        )
    }
}

impl fmt::Display for BranchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchState::Active => f.write_str("active"),
            BranchState::Suspended => f.write_str("suspended"),
            BranchState::Ended => f.write_str("ended"),
            BranchState::Prepared => f.write_str("prepared"),
            BranchState::ReadOnly => f.write_str("read-only"),
            BranchState::Committed => f.write_str("committed"),
            BranchState::RolledBack => f.write_str("rolled back"),
            BranchState::Heuristic(outcome) => write!(f, "{}", outcome),
            BranchState::Unknown { reason } => write!(f, "unknown ({})", reason),
        }
    }
}

/// Why a single branch call did not succeed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BranchFailure {
    #[error(transparent)]
    Xa(#[from] XaError),

    #[error("Call timed out after {0:?}")]
    TimedOut(Duration),
}

impl BranchFailure {
    /// Whether the same call may be reissued.
    pub fn is_retryable(&self) -> bool {
        match self {
            BranchFailure::Xa(error) => error.is_transient(),
            BranchFailure::TimedOut(_) => true,
        }
    }
}

/// Run one resource call, giving up after `timeout`.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, XaError>>,
) -> Result<T, BranchFailure> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(BranchFailure::Xa),
        Err(_) => Err(BranchFailure::TimedOut(timeout)),
    }
}

/// One resource instance enlisted in a transaction under its own xid
#[derive(Debug)]
pub struct ResourceBranch {
    handle: BranchHandle,
    xid: Xid,
    state: BranchState,
}

impl ResourceBranch {
    pub(crate) fn new(handle: BranchHandle, xid: Xid) -> Self {
        Self {
            handle,
            xid,
            state: BranchState::Active,
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    pub fn unique_name(&self) -> &str {
        self.handle.unique_name()
    }

    pub fn resource(&self) -> &Arc<dyn XaResource> {
        self.handle.resource()
    }

    pub fn handle(&self) -> &BranchHandle {
        &self.handle
    }

    pub fn state(&self) -> &BranchState {
        &self.state
    }

    pub fn ordering_position(&self) -> i32 {
        self.handle.ordering_position()
    }

    pub(crate) fn set_state(&mut self, state: BranchState) {
        tracing::debug!(
            "Branch {} ({}): {} -> {}",
            self.xid,
            self.unique_name(),
            self.state,
            state
        );
        self.state = state;
    }

    /// Take over the branch with a new resource instance (TMJOIN).
    pub(crate) fn replace_handle(&mut self, handle: BranchHandle) {
        self.handle = handle;
    }
}
