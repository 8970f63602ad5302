//! Phase two and the one-phase shortcut

use super::{PhaseTwoCall, TwoPhaseCommitDriver, heuristic_of};
use crate::branch::{BranchFailure, BranchState, ResourceBranch, bounded};
use crate::error::{CoordinatorError, Result};
use crate::transaction::{Transaction, TransactionStatus};
use tandem_common::{HeuristicOutcome, TransactionId, XaError};

impl TwoPhaseCommitDriver {
    /// Commit every prepared branch, in order. Each branch ends up committed,
    /// heuristic or unknown; one branch failing never stops the others.
    pub async fn commit_prepared(&self, txn_id: TransactionId, branches: &mut [ResourceBranch]) {
        for branch in branches.iter_mut() {
            if *branch.state() != BranchState::Prepared {
                continue;
            }
            let state = self.commit_branch(txn_id, branch).await;
            branch.set_state(state);
        }
    }

    async fn commit_branch(&self, txn_id: TransactionId, branch: &ResourceBranch) -> BranchState {
        match self.call_with_retry(branch, PhaseTwoCall::Commit).await {
            Ok(()) => BranchState::Committed,
            Err(BranchFailure::Xa(XaError::NotFound)) => {
                tracing::debug!(
                    "Branch {} of {} unknown to {}, assuming committed",
                    branch.xid(),
                    txn_id,
                    branch.unique_name()
                );
                BranchState::Committed
            }
            Err(BranchFailure::Xa(XaError::HeuristicCommit)) => {
                self.forget(branch).await;
                BranchState::Committed
            }
            Err(BranchFailure::Xa(XaError::RolledBack(reason))) => {
                tracing::warn!(
                    "Branch {} of {} rolled back during commit: {}",
                    branch.xid(),
                    txn_id,
                    reason
                );
                BranchState::Heuristic(HeuristicOutcome::Rollback)
            }
            Err(failure) => match heuristic_of(&failure) {
                Some(outcome) => {
                    tracing::warn!(
                        "Branch {} of {} on {}: {}",
                        branch.xid(),
                        txn_id,
                        branch.unique_name(),
                        outcome
                    );
                    BranchState::Heuristic(outcome)
                }
                None => {
                    tracing::error!(
                        "Giving up commit of {} on {} for now: {}",
                        branch.xid(),
                        branch.unique_name(),
                        failure
                    );
                    BranchState::Unknown {
                        reason: failure.to_string(),
                    }
                }
            },
        }
    }

    /// Commit a lone branch without prepare or journal, in a single call.
    pub(super) async fn commit_one_phase(
        &self,
        txn: &Transaction,
        branch: &mut ResourceBranch,
    ) -> Result<()> {
        let txn_id = txn.id();
        let timeout = self.config.branch_timeout(branch.unique_name());
        let xid = *branch.xid();
        let name = branch.unique_name().to_string();

        let result = bounded(timeout, branch.resource().commit(&xid, true)).await;
        match result {
            Ok(()) => {
                branch.set_state(BranchState::Committed);
                txn.set_status(TransactionStatus::Committed);
                tracing::info!("Transaction {} committed in one phase on {}", txn_id, name);
                Ok(())
            }
            Err(BranchFailure::Xa(XaError::RolledBack(reason))) => {
                branch.set_state(BranchState::RolledBack);
                txn.set_status(TransactionStatus::RolledBack);
                Err(CoordinatorError::Rollback {
                    txn_id,
                    reason: format!("{} rolled back: {}", name, reason),
                })
            }
            Err(BranchFailure::Xa(XaError::HeuristicCommit)) => {
                self.forget(branch).await;
                branch.set_state(BranchState::Committed);
                txn.set_status(TransactionStatus::Committed);
                Ok(())
            }
            Err(failure) => {
                txn.set_status(TransactionStatus::Unknown);
                match heuristic_of(&failure) {
                    Some(HeuristicOutcome::Rollback) => {
                        branch.set_state(BranchState::Heuristic(HeuristicOutcome::Rollback));
                        Err(CoordinatorError::HeuristicRollback {
                            txn_id,
                            branches: vec![name],
                        })
                    }
                    Some(outcome) => {
                        branch.set_state(BranchState::Heuristic(outcome));
                        Err(CoordinatorError::HeuristicMixed {
                            txn_id,
                            committed: Vec::new(),
                            failed: vec![name],
                        })
                    }
                    None => {
                        branch.set_state(BranchState::Unknown {
                            reason: failure.to_string(),
                        });
                        Err(CoordinatorError::System {
                            txn_id,
                            reason: format!("one-phase commit outcome unknown: {}", failure),
                            branches: vec![name],
                        })
                    }
                }
            }
        }
    }
}
