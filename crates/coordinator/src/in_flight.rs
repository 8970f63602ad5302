//! Transactions that have begun but not yet completed

use crate::transaction::Transaction;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tandem_common::TransactionId;

/// Map of live transactions, keyed by id.
///
/// Entries hold weak references: a transaction the application dropped
/// without completing disappears on the next [`live`](Self::live) sweep.
#[derive(Default)]
pub struct InFlightTransactions {
    transactions: DashMap<TransactionId, Weak<Transaction>>,
}

impl InFlightTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, txn: &Arc<Transaction>) {
        self.transactions.insert(txn.id(), Arc::downgrade(txn));
    }

    pub(crate) fn remove(&self, id: &TransactionId) {
        self.transactions.remove(id);
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.transactions
            .get(id)
            .is_some_and(|entry| entry.strong_count() > 0)
    }

    /// Every live transaction; entries of dropped ones are pruned.
    pub fn live(&self) -> Vec<Arc<Transaction>> {
        let mut live = Vec::new();
        self.transactions.retain(|_, weak| match weak.upgrade() {
            Some(txn) => {
                live.push(txn);
                true
            }
            None => false,
        });
        live
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
