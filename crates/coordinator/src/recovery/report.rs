//! Outcome of a recovery pass

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tandem_common::{HeuristicOutcome, TransactionId, Xid};

/// Decision recovery tried to deliver to a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Rollback,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => f.write_str("commit"),
            Decision::Rollback => f.write_str("rollback"),
        }
    }
}

/// A branch whose resource manager resolved it against the decision.
///
/// It stays out of every later pass until an operator forgets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicBranch {
    pub producer: String,
    pub xid: Xid,
    pub decision: Decision,
    pub outcome: HeuristicOutcome,
}

impl fmt::Display for HeuristicBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {}: {} against a {} decision",
            self.xid, self.producer, self.outcome, self.decision
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Transactions with at least one branch committed by this pass
    pub committed: BTreeSet<TransactionId>,
    /// Transactions with at least one branch rolled back by this pass
    pub rolled_back: BTreeSet<TransactionId>,
    /// Dangling transactions whose branches were all already resolved
    pub finalized: BTreeSet<TransactionId>,
    pub heuristics: Vec<HeuristicBranch>,
    /// Producers whose scan failed, with the error
    pub failed: BTreeMap<String, String>,
    pub(crate) unresolved: BTreeSet<TransactionId>,
}

impl RecoveryReport {
    /// Transactions still dangling in the journal after the pass.
    pub fn unresolved(&self) -> &BTreeSet<TransactionId> {
        &self.unresolved
    }

    /// Whether the pass left nothing for a later pass or an operator.
    pub fn is_clean(&self) -> bool {
        self.heuristics.is_empty() && self.failed.is_empty() && self.unresolved.is_empty()
    }
}
