//! In-memory journal for tests

use crate::error::{JournalError, Result};
use crate::index::DanglingIndex;
use crate::record::{JournalRecord, RecordStatus};
use crate::{DanglingRecords, Journal};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_common::TransactionId;

#[derive(Default)]
struct State {
    records: Vec<JournalRecord>,
    index: DanglingIndex,
    closed: bool,
}

/// Journal that keeps every record in memory.
///
/// Writes can be made to fail on demand to exercise journal-failure paths.
#[derive(Default)]
pub struct MemoryJournal {
    state: Mutex<State>,
    fail_writes: AtomicBool,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records written so far, in write order.
    pub fn records(&self) -> Vec<JournalRecord> {
        self.state.lock().records.clone()
    }

    /// Make every following write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }
}

impl Journal for MemoryJournal {
    fn log(
        &self,
        status: RecordStatus,
        txn_id: TransactionId,
        unique_names: &BTreeSet<String>,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(JournalError::Failed);
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(JournalError::Closed);
        }

        let record = JournalRecord {
            status,
            txn_id,
            sequence: state.records.len() as u64 + 1,
            time: 0,
            unique_names: unique_names.clone(),
        };
        state.index.apply(&record);
        state.records.push(record);
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn collect_dangling_records(&self) -> Result<DanglingRecords> {
        Ok(DanglingRecords::new(self.state.lock().index.dangling()))
    }

    fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
