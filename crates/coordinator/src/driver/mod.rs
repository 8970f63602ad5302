//! Two-phase commit driver
//!
//! The driver walks the branches of a transaction through prepare, the
//! durable decision and phase two. Branch state is the source of truth: each
//! phase updates the branches it touches, and outcomes are derived from the
//! resulting states.
//!
//! Ordering rules:
//! - the commit decision is journaled before any branch is told to commit
//! - phase two visits branches in enlistment order
//! - a "done" record only names resources whose branches are all resolved

mod commit;
mod prepare;
mod rollback;

pub use prepare::PrepareOutcome;

use crate::branch::{BranchFailure, BranchState, ResourceBranch, bounded};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::transaction::{Transaction, TransactionStatus};
use std::collections::BTreeSet;
use std::sync::Arc;
use tandem_common::{HeuristicOutcome, TransactionId, XaError};
use tandem_journal::{Journal, RecordStatus};

#[derive(Debug, Clone, Copy)]
enum PhaseTwoCall {
    Commit,
    Rollback,
}

/// Drives prepare, decision logging, commit and rollback of transactions
pub struct TwoPhaseCommitDriver {
    journal: Arc<dyn Journal>,
    config: Arc<CoordinatorConfig>,
}

impl TwoPhaseCommitDriver {
    pub fn new(journal: Arc<dyn Journal>, config: Arc<CoordinatorConfig>) -> Self {
        Self { journal, config }
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    /// Complete a transaction with a commit.
    ///
    /// A transaction marked rollback-only is rolled back instead and reported
    /// as [`CoordinatorError::Rollback`].
    pub async fn commit(&self, txn: &Transaction) -> Result<()> {
        let txn_id = txn.id();
        let mut enlistment = txn.enlistment().lock().await;
        enlistment.seal();

        let ended = enlistment.delist_unended().await;

        if let Some(reason) = txn.rollback_reason() {
            return self
                .rollback_marked(txn, enlistment.branches_mut(), reason)
                .await;
        }

        if let Err(e) = ended {
            tracing::warn!("Cannot end branches of {} before prepare: {}", txn_id, e);
            return self
                .rollback_marked(txn, enlistment.branches_mut(), e.to_string())
                .await;
        }

        txn.set_status(TransactionStatus::Preparing);
        let branches = enlistment.branches_mut();

        if branches.is_empty() {
            txn.set_status(TransactionStatus::Committed);
            tracing::debug!("Committed transaction {} without branches", txn_id);
            return Ok(());
        }

        if self.config.one_phase_optimization && branches.len() == 1 {
            return self.commit_one_phase(txn, &mut branches[0]).await;
        }

        match self.prepare(txn_id, branches).await {
            PrepareOutcome::Prepared => {}
            PrepareOutcome::ReadOnly => {
                txn.set_status(TransactionStatus::Committed);
                tracing::info!(
                    "Transaction {} committed: all {} branches read-only",
                    txn_id,
                    branches.len()
                );
                return Ok(());
            }
            PrepareOutcome::Failed { index, failure } => {
                return self.abort_prepare(txn, branches, index, failure).await;
            }
        }

        txn.set_status(TransactionStatus::Prepared);
        txn.set_status(TransactionStatus::Committing);

        let names: BTreeSet<String> = branches
            .iter()
            .filter(|b| *b.state() == BranchState::Prepared)
            .map(|b| b.unique_name().to_string())
            .collect();

        // Nothing has been committed yet: without the record, recovery
        // presumes abort for every prepared branch.
        if let Err(e) = self.journal.log(RecordStatus::Committing, txn_id, &names) {
            tracing::error!("Cannot journal commit decision of {}: {}", txn_id, e);
            txn.set_status(TransactionStatus::Unknown);
            return Err(CoordinatorError::System {
                txn_id,
                reason: format!("journal failed before commit: {}", e),
                branches: names.into_iter().collect(),
            });
        }

        self.commit_prepared(txn_id, branches).await;
        let done = self.log_done(txn_id, branches, &names);

        if let Some(error) = commit_outcome(txn_id, branches) {
            txn.set_status(TransactionStatus::Unknown);
            tracing::warn!("Transaction {} ended heuristically: {}", txn_id, error);
            return Err(error);
        }

        txn.set_status(TransactionStatus::Committed);
        if let Err(e) = done {
            // Every branch committed; recovery writes the record later.
            return Err(CoordinatorError::System {
                txn_id,
                reason: format!("committed, but cannot journal completion: {}", e),
                branches: names.into_iter().collect(),
            });
        }
        tracing::info!(
            "Transaction {} committed ({} resources)",
            txn_id,
            names.len()
        );
        Ok(())
    }

    /// Roll a transaction back on request.
    pub async fn rollback(&self, txn: &Transaction) -> Result<()> {
        let txn_id = txn.id();
        let mut enlistment = txn.enlistment().lock().await;
        enlistment.seal();

        if let Err(e) = enlistment.delist_unended().await {
            tracing::warn!("Cannot end branches of {} before rollback: {}", txn_id, e);
        }

        txn.set_status(TransactionStatus::RollingBack);
        let branches = enlistment.branches_mut();
        self.rollback_branches(txn_id, branches, |state| !state.is_resolved())
            .await;

        if let Some(error) = rollback_outcome(txn_id, branches) {
            txn.set_status(TransactionStatus::Unknown);
            return Err(error);
        }

        txn.set_status(TransactionStatus::RolledBack);
        tracing::info!("Transaction {} rolled back", txn_id);
        Ok(())
    }

    /// Roll back a transaction that was doomed before prepare.
    async fn rollback_marked(
        &self,
        txn: &Transaction,
        branches: &mut [ResourceBranch],
        reason: String,
    ) -> Result<()> {
        let txn_id = txn.id();
        txn.set_status(TransactionStatus::RollingBack);
        self.rollback_branches(txn_id, branches, |state| !state.is_resolved())
            .await;

        if let Some(error) = rollback_outcome(txn_id, branches) {
            txn.set_status(TransactionStatus::Unknown);
            return Err(error);
        }

        txn.set_status(TransactionStatus::RolledBack);
        tracing::info!("Transaction {} rolled back: {}", txn_id, reason);
        Err(CoordinatorError::Rollback { txn_id, reason })
    }

    /// Undo a failed prepare phase.
    ///
    /// Branches that prepared and branches never asked to prepare are rolled
    /// back; the failing branch gets no further calls. Prepared branches that
    /// cannot be rolled back are journaled with a rollback decision so that
    /// recovery finishes them.
    async fn abort_prepare(
        &self,
        txn: &Transaction,
        branches: &mut [ResourceBranch],
        index: usize,
        failure: BranchFailure,
    ) -> Result<()> {
        let txn_id = txn.id();
        let reason = format!(
            "{} failed to prepare: {}",
            branches[index].unique_name(),
            failure
        );
        tracing::warn!("Rolling back {}: {}", txn_id, reason);
        txn.set_status(TransactionStatus::RollingBack);

        let was_prepared: Vec<bool> = branches
            .iter()
            .map(|b| *b.state() == BranchState::Prepared)
            .collect();
        self.rollback_branches(txn_id, branches, |state| {
            matches!(state, BranchState::Prepared | BranchState::Ended)
        })
        .await;

        let stuck: BTreeSet<String> = branches
            .iter()
            .zip(&was_prepared)
            .filter(|(branch, prepared)| **prepared && !branch.state().is_resolved())
            .map(|(branch, _)| branch.unique_name().to_string())
            .collect();

        if stuck.is_empty() {
            txn.set_status(TransactionStatus::RolledBack);
            tracing::info!("Transaction {} rolled back: {}", txn_id, reason);
            return Err(CoordinatorError::Rollback { txn_id, reason });
        }

        if let Err(e) = self.journal.log(RecordStatus::RollingBack, txn_id, &stuck) {
            tracing::error!("Cannot journal rollback decision of {}: {}", txn_id, e);
        }
        txn.set_status(TransactionStatus::Unknown);
        Err(CoordinatorError::System {
            txn_id,
            reason: format!("{}; rollback incomplete", reason),
            branches: stuck.into_iter().collect(),
        })
    }

    /// Journal which of the decided resources are now fully resolved.
    fn log_done(
        &self,
        txn_id: TransactionId,
        branches: &[ResourceBranch],
        names: &BTreeSet<String>,
    ) -> tandem_journal::Result<()> {
        let resolved: BTreeSet<String> = names
            .iter()
            .filter(|name| {
                branches
                    .iter()
                    .filter(|b| b.unique_name() == name.as_str())
                    .all(|b| b.state().is_resolved())
            })
            .cloned()
            .collect();

        if resolved.is_empty() {
            return Ok(());
        }

        self.journal
            .log(RecordStatus::Done, txn_id, &resolved)
            .inspect_err(|e| tracing::error!("Cannot journal completion of {}: {}", txn_id, e))
    }

    /// Issue a phase-two call, retrying transient failures with backoff.
    async fn call_with_retry(
        &self,
        branch: &ResourceBranch,
        call: PhaseTwoCall,
    ) -> std::result::Result<(), BranchFailure> {
        let policy = &self.config.commit_retry;
        let max_attempts = policy.max_attempts.max(1);
        let timeout = self.config.branch_timeout(branch.unique_name());
        let xid = *branch.xid();
        let mut attempt = 1;

        loop {
            let result = match call {
                PhaseTwoCall::Commit => bounded(timeout, branch.resource().commit(&xid, false)).await,
                PhaseTwoCall::Rollback => bounded(timeout, branch.resource().rollback(&xid)).await,
            };

            match result {
                Ok(()) => return Ok(()),
                Err(failure) if failure.is_retryable() && attempt < max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        "{:?} of {} on {} failed (attempt {}/{}): {}; retrying in {:?}",
                        call,
                        xid,
                        branch.unique_name(),
                        attempt,
                        max_attempts,
                        failure,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    /// Tell the resource manager to discard a heuristic outcome.
    async fn forget(&self, branch: &ResourceBranch) {
        let timeout = self.config.branch_timeout(branch.unique_name());
        let xid = *branch.xid();
        match bounded(timeout, branch.resource().forget(&xid)).await {
            Ok(()) | Err(BranchFailure::Xa(XaError::NotFound)) => {}
            Err(e) => tracing::warn!(
                "Cannot forget heuristic branch {} on {}: {}",
                xid,
                branch.unique_name(),
                e
            ),
        }
    }
}

/// Heuristic outcome carried by a failure, if any.
pub(crate) fn heuristic_of(failure: &BranchFailure) -> Option<HeuristicOutcome> {
    match failure {
        BranchFailure::Xa(error) => error.heuristic(),
        BranchFailure::TimedOut(_) => None,
    }
}

/// Error to surface once phase two is over, `None` when everything committed.
fn commit_outcome(txn_id: TransactionId, branches: &[ResourceBranch]) -> Option<CoordinatorError> {
    let unresolved: Vec<&ResourceBranch> = branches
        .iter()
        .filter(|b| !b.state().is_resolved())
        .collect();
    if unresolved.is_empty() {
        return None;
    }

    let committed: Vec<String> = branches
        .iter()
        .filter(|b| *b.state() == BranchState::Committed)
        .map(|b| b.unique_name().to_string())
        .collect();
    let failed: Vec<String> = unresolved
        .iter()
        .map(|b| b.unique_name().to_string())
        .collect();

    let all_rolled_back = unresolved
        .iter()
        .all(|b| *b.state() == BranchState::Heuristic(HeuristicOutcome::Rollback));

    if committed.is_empty() && all_rolled_back {
        Some(CoordinatorError::HeuristicRollback {
            txn_id,
            branches: failed,
        })
    } else {
        Some(CoordinatorError::HeuristicMixed {
            txn_id,
            committed,
            failed,
        })
    }
}

/// Error to surface after a rollback, `None` unless some branch committed
/// (or may have committed) on its own.
fn rollback_outcome(
    txn_id: TransactionId,
    branches: &[ResourceBranch],
) -> Option<CoordinatorError> {
    let mut heuristic_commits = Vec::new();
    let mut others = Vec::new();
    for branch in branches {
        match branch.state() {
            BranchState::Heuristic(HeuristicOutcome::Commit) => {
                heuristic_commits.push(branch.unique_name().to_string())
            }
            BranchState::Heuristic(_) => others.push(branch.unique_name().to_string()),
            BranchState::Unknown { reason } => {
                tracing::warn!(
                    "Rollback of {} on {} not confirmed: {}",
                    branch.xid(),
                    branch.unique_name(),
                    reason
                );
            }
            _ => {}
        }
    }

    if heuristic_commits.is_empty() && others.is_empty() {
        return None;
    }

    let rolled_back = branches
        .iter()
        .any(|b| *b.state() == BranchState::RolledBack);

    if others.is_empty() && !rolled_back {
        Some(CoordinatorError::HeuristicCommit {
            txn_id,
            branches: heuristic_commits,
        })
    } else {
        Some(CoordinatorError::HeuristicMixed {
            txn_id,
            committed: heuristic_commits,
            failed: others,
        })
    }
}
