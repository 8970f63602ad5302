//! In-memory index of unresolved decisions

use crate::record::{JournalRecord, RecordStatus};
use std::collections::{BTreeMap, BTreeSet};
use tandem_common::TransactionId;

#[derive(Debug)]
struct Entry {
    decision: JournalRecord,
    done: BTreeSet<String>,
}

/// Tracks, per transaction, the latest decision record and which of its
/// resources have been reported done. A transaction stops dangling once its
/// "done" records cover every resource named by the decision.
#[derive(Debug, Default)]
pub(crate) struct DanglingIndex {
    entries: BTreeMap<TransactionId, Entry>,
}

impl DanglingIndex {
    pub(crate) fn apply(&mut self, record: &JournalRecord) {
        match record.status {
            RecordStatus::Committing | RecordStatus::RollingBack => {
                if record.unique_names.is_empty() {
                    self.entries.remove(&record.txn_id);
                    return;
                }
                self.entries.insert(
                    record.txn_id,
                    Entry {
                        decision: record.clone(),
                        done: BTreeSet::new(),
                    },
                );
            }
            RecordStatus::Done => {
                let resolved = match self.entries.get_mut(&record.txn_id) {
                    Some(entry) => {
                        entry.done.extend(record.unique_names.iter().cloned());
                        entry.decision.unique_names.is_subset(&entry.done)
                    }
                    None => false,
                };
                if resolved {
                    self.entries.remove(&record.txn_id);
                }
            }
        }
    }

    /// Decision records still waiting, each reduced to its unresolved names.
    pub(crate) fn dangling(&self) -> Vec<JournalRecord> {
        self.entries
            .values()
            .map(|entry| {
                let mut record = entry.decision.clone();
                record.unique_names = record
                    .unique_names
                    .difference(&entry.done)
                    .cloned()
                    .collect();
                record
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
