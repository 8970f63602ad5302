//! Branch rollback

use super::{PhaseTwoCall, TwoPhaseCommitDriver, heuristic_of};
use crate::branch::{BranchFailure, BranchState, ResourceBranch};
use tandem_common::{TransactionId, XaError};

impl TwoPhaseCommitDriver {
    /// Roll back every branch whose state matches `select`, in order.
    pub async fn rollback_branches(
        &self,
        txn_id: TransactionId,
        branches: &mut [ResourceBranch],
        select: impl Fn(&BranchState) -> bool,
    ) {
        for branch in branches.iter_mut() {
            if !select(branch.state()) {
                continue;
            }
            let state = self.rollback_branch(txn_id, branch).await;
            branch.set_state(state);
        }
    }

    async fn rollback_branch(&self, txn_id: TransactionId, branch: &ResourceBranch) -> BranchState {
        match self.call_with_retry(branch, PhaseTwoCall::Rollback).await {
            Ok(()) | Err(BranchFailure::Xa(XaError::NotFound | XaError::RolledBack(_))) => {
                BranchState::RolledBack
            }
            Err(BranchFailure::Xa(XaError::HeuristicRollback)) => {
                self.forget(branch).await;
                BranchState::RolledBack
            }
            Err(failure) => match heuristic_of(&failure) {
                Some(outcome) => {
                    tracing::warn!(
                        "Branch {} of {} on {}: {} during rollback",
                        branch.xid(),
                        txn_id,
                        branch.unique_name(),
                        outcome
                    );
                    BranchState::Heuristic(outcome)
                }
                None => BranchState::Unknown {
                    reason: failure.to_string(),
                },
            },
        }
    }
}
