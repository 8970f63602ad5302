//! Decision journal for the Tandem transaction coordinator
//!
//! The journal is the source of truth for every transaction that reached a
//! commit (or forced rollback) decision. It holds three kinds of records:
//! decisions (`Committing`, `RollingBack`) and `Done` acknowledgements. A
//! decision stays "dangling" until done records cover all of its resources.

mod config;
mod disk;
mod error;
mod index;
mod memory;
mod record;
mod segment;

pub use config::JournalConfig;
pub use disk::DiskJournal;
pub use error::{JournalError, Result};
pub use memory::MemoryJournal;
pub use record::{FRAME_OVERHEAD, FrameRead, JournalRecord, RecordStatus, read_frame};

use std::collections::BTreeSet;
use tandem_common::TransactionId;

/// Append-only store of transaction decisions
pub trait Journal: Send + Sync {
    /// Append one record. Decision records are durable when this returns.
    fn log(
        &self,
        status: RecordStatus,
        txn_id: TransactionId,
        unique_names: &BTreeSet<String>,
    ) -> Result<()>;

    /// Flush everything written so far to stable storage.
    fn force(&self) -> Result<()>;

    /// Decisions not yet fully done, each listing only its unresolved resources.
    fn collect_dangling_records(&self) -> Result<DanglingRecords>;

    /// Whether the active segment is full enough to warrant a rotation.
    fn needs_rotation(&self) -> bool {
        false
    }

    /// Compact the journal down to its dangling records.
    fn rotate(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()>;
}

/// Snapshot of the dangling records, ordered by transaction id
#[derive(Debug)]
pub struct DanglingRecords {
    records: std::vec::IntoIter<JournalRecord>,
}

impl DanglingRecords {
    pub(crate) fn new(records: Vec<JournalRecord>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

impl Iterator for DanglingRecords {
    type Item = JournalRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}
