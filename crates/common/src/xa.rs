//! XA protocol flags, votes and error codes

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Flag passed to `start` when associating work with a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartFlag {
    /// TMNOFLAGS: a new branch
    NoFlags,
    /// TMJOIN: join a branch previously ended on the same resource manager
    Join,
    /// TMRESUME: resume a suspended branch
    Resume,
}

/// Flag passed to `end` when dissociating work from a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndFlag {
    /// TMSUCCESS: work completed normally
    Success,
    /// TMFAIL: work failed, the branch may only roll back
    Fail,
    /// TMSUSPEND: association suspended, to be resumed later
    Suspend,
}

/// Vote returned by a successful prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vote {
    /// XA_OK: prepared, waiting for the decision
    Ok,
    /// XA_RDONLY: nothing to commit, the branch is already resolved
    ReadOnly,
}

/// Outcome of a resource manager resolving a branch on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeuristicOutcome {
    Commit,
    Rollback,
    Mixed,
    Hazard,
}

impl fmt::Display for HeuristicOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeuristicOutcome::Commit => "heuristic commit",
            HeuristicOutcome::Rollback => "heuristic rollback",
            HeuristicOutcome::Mixed => "heuristic mixed",
            HeuristicOutcome::Hazard => "heuristic hazard",
        };
        f.write_str(name)
    }
}

/// Errors reported by an XA resource
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum XaError {
    /// XA_RB*: the branch has been rolled back
    #[error("Branch rolled back: {0}")]
    RolledBack(String),

    /// XA_HEURCOM
    #[error("Branch was heuristically committed")]
    HeuristicCommit,

    /// XA_HEURRB
    #[error("Branch was heuristically rolled back")]
    HeuristicRollback,

    /// XA_HEURMIX
    #[error("Branch was partially committed and partially rolled back")]
    HeuristicMixed,

    /// XA_HEURHAZ
    #[error("Branch may have been heuristically completed")]
    HeuristicHazard,

    /// XAER_NOTA: the resource manager does not know the branch
    #[error("Unknown branch")]
    NotFound,

    /// XAER_RMFAIL: the resource manager is unavailable
    #[error("Resource manager unavailable: {0}")]
    Unavailable(String),

    /// XAER_RMERR: the resource manager failed the call
    #[error("Resource manager error: {0}")]
    ResourceError(String),

    /// XAER_PROTO: call made in the wrong state
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// XA_RETRY: the call had no effect and may be reissued
    #[error("Operation may be retried")]
    Retry,
}

impl XaError {
    /// The heuristic outcome carried by this error, if any.
    pub fn heuristic(&self) -> Option<HeuristicOutcome> {
        match self {
            XaError::HeuristicCommit => Some(HeuristicOutcome::Commit),
            XaError::HeuristicRollback => Some(HeuristicOutcome::Rollback),
            XaError::HeuristicMixed => Some(HeuristicOutcome::Mixed),
            XaError::HeuristicHazard => Some(HeuristicOutcome::Hazard),
            _ => None,
        }
    }

    /// Whether reissuing the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, XaError::Unavailable(_) | XaError::Retry)
    }
}
