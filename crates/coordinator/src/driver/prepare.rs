//! Phase one

use super::TwoPhaseCommitDriver;
use crate::branch::{BranchFailure, BranchState, ResourceBranch, bounded};
use tandem_common::{TransactionId, Vote, XaError};
use tokio::task::JoinSet;

/// Result of the prepare phase
#[derive(Debug)]
pub enum PrepareOutcome {
    /// At least one branch is prepared and waits for the decision
    Prepared,
    /// Every branch voted read-only; nothing is left to commit
    ReadOnly,
    /// A branch failed; `index` is the first failing branch in order
    Failed { index: usize, failure: BranchFailure },
}

impl TwoPhaseCommitDriver {
    /// Ask every branch to prepare and record the votes on the branches.
    pub async fn prepare(
        &self,
        txn_id: TransactionId,
        branches: &mut [ResourceBranch],
    ) -> PrepareOutcome {
        if self.config.parallel_prepare && branches.len() > 1 {
            self.prepare_parallel(txn_id, branches).await
        } else {
            self.prepare_sequential(txn_id, branches).await
        }
    }

    async fn prepare_sequential(
        &self,
        txn_id: TransactionId,
        branches: &mut [ResourceBranch],
    ) -> PrepareOutcome {
        for (index, branch) in branches.iter_mut().enumerate() {
            let timeout = self.config.branch_timeout(branch.unique_name());
            let xid = *branch.xid();
            let result = bounded(timeout, branch.resource().prepare(&xid)).await;

            if let Err(failure) = record_vote(txn_id, branch, result) {
                return PrepareOutcome::Failed { index, failure };
            }
        }
        summarize(branches)
    }

    /// Prepare all branches at once; every vote is collected before deciding.
    async fn prepare_parallel(
        &self,
        txn_id: TransactionId,
        branches: &mut [ResourceBranch],
    ) -> PrepareOutcome {
        let mut tasks = JoinSet::new();
        for (index, branch) in branches.iter().enumerate() {
            let timeout = self.config.branch_timeout(branch.unique_name());
            let resource = branch.resource().clone();
            let xid = *branch.xid();
            tasks.spawn(async move { (index, bounded(timeout, resource.prepare(&xid)).await) });
        }

        let mut votes: Vec<Option<Result<Vote, BranchFailure>>> =
            (0..branches.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => votes[index] = Some(result),
                Err(e) => tracing::error!("Prepare task of {} did not finish: {}", txn_id, e),
            }
        }

        let mut failed = None;
        for (index, (branch, vote)) in branches.iter_mut().zip(votes).enumerate() {
            let result = vote.unwrap_or_else(|| {
                Err(BranchFailure::Xa(XaError::ResourceError(
                    "prepare task aborted".to_string(),
                )))
            });
            if let Err(failure) = record_vote(txn_id, branch, result)
                && failed.is_none()
            {
                failed = Some(PrepareOutcome::Failed { index, failure });
            }
        }

        match failed {
            Some(outcome) => outcome,
            None => summarize(branches),
        }
    }
}

fn record_vote(
    txn_id: TransactionId,
    branch: &mut ResourceBranch,
    result: Result<Vote, BranchFailure>,
) -> Result<(), BranchFailure> {
    match result {
        Ok(Vote::Ok) => {
            branch.set_state(BranchState::Prepared);
            Ok(())
        }
        Ok(Vote::ReadOnly) => {
            tracing::debug!(
                "Branch {} of {} voted read-only",
                branch.xid(),
                txn_id
            );
            branch.set_state(BranchState::ReadOnly);
            Ok(())
        }
        Err(failure) => {
            tracing::warn!(
                "Prepare of {} on {} failed: {}",
                branch.xid(),
                branch.unique_name(),
                failure
            );
            let state = match &failure {
                BranchFailure::Xa(XaError::RolledBack(_)) => BranchState::RolledBack,
                other => BranchState::Unknown {
                    reason: other.to_string(),
                },
            };
            branch.set_state(state);
            Err(failure)
        }
    }
}

fn summarize(branches: &[ResourceBranch]) -> PrepareOutcome {
    if branches.iter().all(|b| *b.state() == BranchState::ReadOnly) {
        PrepareOutcome::ReadOnly
    } else {
        PrepareOutcome::Prepared
    }
}
