//! Error types for the coordinator

use tandem_common::TransactionId;
use tandem_journal::JournalError;
use thiserror::Error;

/// Coordinator error types
///
/// The first five variants are the outcomes an application sees when a
/// transaction does not simply commit.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Transaction {txn_id} rolled back: {reason}")]
    Rollback { txn_id: TransactionId, reason: String },

    #[error(
        "Transaction {txn_id} partially completed: committed {committed:?}, unresolved {failed:?}"
    )]
    HeuristicMixed {
        txn_id: TransactionId,
        committed: Vec<String>,
        failed: Vec<String>,
    },

    #[error("Transaction {txn_id} was heuristically rolled back by {branches:?}")]
    HeuristicRollback {
        txn_id: TransactionId,
        branches: Vec<String>,
    },

    #[error("Transaction {txn_id} was heuristically committed by {branches:?}")]
    HeuristicCommit {
        txn_id: TransactionId,
        branches: Vec<String>,
    },

    #[error("System error in transaction {txn_id}: {reason} (branches {branches:?})")]
    System {
        txn_id: TransactionId,
        reason: String,
        branches: Vec<String>,
    },

    #[error("Invalid transaction state: {0}")]
    WrongState(String),

    #[error("Enlistment failed: {0}")]
    Enlistment(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Resource producer already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Resource producer not registered: {0}")]
    NotRegistered(String),

    #[error("Recovery of {producer} failed: {reason}")]
    Recovery { producer: String, reason: String },

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
}

impl CoordinatorError {
    /// Whether the error reports a consistency gap that needs an operator.
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            CoordinatorError::HeuristicMixed { .. }
                | CoordinatorError::HeuristicRollback { .. }
                | CoordinatorError::HeuristicCommit { .. }
        )
    }
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
