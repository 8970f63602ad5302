//! Double-buffered disk journal
//!
//! Records are appended to the active one of two segment files. When the
//! active segment fills up, the records that still matter (decisions whose
//! resources are not all done) are copied into the other segment, which then
//! becomes active. Older history is discarded at that point.

use crate::config::JournalConfig;
use crate::error::{JournalError, Result};
use crate::index::DanglingIndex;
use crate::record::{JournalRecord, RecordStatus};
use crate::segment::{HEADER_SIZE, Segment};
use crate::{DanglingRecords, Journal};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tandem_common::TransactionId;

const SEGMENT_FILES: [&str; 2] = ["part1.tlog", "part2.tlog"];

struct Writer {
    segments: [Segment; 2],
    active: usize,
    next_sequence: u64,
    closed: bool,
}

impl Writer {
    fn active(&mut self) -> &mut Segment {
        &mut self.segments[self.active]
    }
}

/// Crash-durable journal backed by two alternating segment files
pub struct DiskJournal {
    config: JournalConfig,
    writer: Mutex<Writer>,
    index: RwLock<DanglingIndex>,
    /// Write position in the active segment, readable without the writer lock
    position: AtomicU64,
    failed: AtomicBool,
}

impl DiskJournal {
    /// Open the journal in `config.directory`, replaying the active segment.
    ///
    /// A torn or corrupt tail is cut off; everything before it is kept.
    pub fn open(config: JournalConfig) -> Result<Self> {
        fs::create_dir_all(&config.directory)?;

        let (mut first, first_generation) =
            Segment::open(&config.directory.join(SEGMENT_FILES[0]))?;
        let (mut second, second_generation) =
            Segment::open(&config.directory.join(SEGMENT_FILES[1]))?;

        let active = match (first_generation, second_generation) {
            (None | Some(0), None | Some(0)) => {
                tracing::info!("Initializing new journal in {:?}", config.directory);
                first.reset(1)?;
                first.sync()?;
                second.reset(0)?;
                second.sync()?;
                0
            }
            (first_generation, second_generation) => {
                if first_generation.unwrap_or(0) >= second_generation.unwrap_or(0) {
                    0
                } else {
                    1
                }
            }
        };

        let mut segments = [first, second];
        let scan = segments[active].scan()?;
        if scan.valid_end < scan.file_len {
            tracing::warn!(
                "Journal {:?}: discarding {} bytes of incomplete tail",
                segments[active].path(),
                scan.file_len - scan.valid_end
            );
        }
        segments[active].truncate_to(scan.valid_end)?;

        let mut index = DanglingIndex::default();
        for record in &scan.records {
            index.apply(record);
        }
        let next_sequence = scan.records.last().map(|r| r.sequence + 1).unwrap_or(1);

        tracing::info!(
            "Opened journal {:?}: generation {}, {} records, {} dangling",
            segments[active].path(),
            segments[active].generation(),
            scan.records.len(),
            index.len()
        );

        let position = segments[active].position();
        Ok(Self {
            config,
            writer: Mutex::new(Writer {
                segments,
                active,
                next_sequence,
                closed: false,
            }),
            index: RwLock::new(index),
            position: AtomicU64::new(position),
            failed: AtomicBool::new(false),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Whether a write has failed. A failed journal rejects all further writes.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Every record currently in the active segment, in write order.
    pub fn read_records(&self) -> Result<Vec<JournalRecord>> {
        let mut writer = self.writer.lock();
        Ok(writer.active().scan()?.records)
    }

    fn check_writable(&self, writer: &Writer) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(JournalError::Failed);
        }
        if writer.closed {
            return Err(JournalError::Closed);
        }
        Ok(())
    }

    /// Record an I/O failure; from here on the journal refuses writes.
    fn fail(&self, error: JournalError) -> JournalError {
        if let JournalError::Io(e) = &error {
            tracing::error!("Journal {:?} failed: {}", self.config.directory, e);
            self.failed.store(true, Ordering::Release);
        }
        error
    }

    fn rotate_locked(&self, writer: &mut Writer) -> Result<()> {
        let dangling = self.index.read().dangling();
        let mut sequence = writer.next_sequence;
        let mut buffer = Vec::new();
        for mut record in dangling.iter().cloned() {
            record.sequence = sequence;
            sequence += 1;
            buffer.extend(record.encode().map_err(JournalError::InvalidRecord)?);
        }

        if HEADER_SIZE + buffer.len() as u64 > self.config.segment_capacity {
            return Err(JournalError::SegmentFull {
                dangling: dangling.len(),
            });
        }

        let next_generation = writer.segments[writer.active].generation() + 1;
        let target = 1 - writer.active;
        let segment = &mut writer.segments[target];

        // Generation zero until the copy is durable, so a crash mid-rotation
        // leaves the old segment in charge.
        segment.reset(0)?;
        segment.append(&buffer, false)?;
        segment.sync()?;
        segment.write_header(next_generation)?;
        segment.sync()?;

        writer.active = target;
        writer.next_sequence = sequence;
        self.position
            .store(writer.segments[target].position(), Ordering::Release);

        tracing::info!(
            "Rotated journal to {:?} (generation {}), carried {} dangling records",
            writer.segments[target].path(),
            next_generation,
            dangling.len()
        );
        Ok(())
    }
}

impl Journal for DiskJournal {
    fn log(
        &self,
        status: RecordStatus,
        txn_id: TransactionId,
        unique_names: &BTreeSet<String>,
    ) -> Result<()> {
        let mut writer = self.writer.lock();
        self.check_writable(&writer)?;

        let mut record = JournalRecord {
            status,
            txn_id,
            sequence: writer.next_sequence,
            time: now_micros(),
            unique_names: unique_names.clone(),
        };
        let mut frame = record.encode().map_err(JournalError::InvalidRecord)?;

        let capacity = self.config.segment_capacity;
        if HEADER_SIZE + frame.len() as u64 > capacity {
            return Err(JournalError::RecordTooLarge {
                size: frame.len(),
                capacity,
            });
        }

        if writer.active().position() + frame.len() as u64 > capacity {
            self.rotate_locked(&mut writer).map_err(|e| self.fail(e))?;
            // Rotation consumed sequence numbers for the copied records.
            record.sequence = writer.next_sequence;
            frame = record.encode().map_err(JournalError::InvalidRecord)?;
            if writer.active().position() + frame.len() as u64 > capacity {
                return Err(JournalError::SegmentFull {
                    dangling: self.index.read().len(),
                });
            }
        }

        let sync = status.is_decision() || self.config.sync_done_records;
        writer
            .active()
            .append(&frame, sync)
            .map_err(|e| self.fail(e))?;
        writer.next_sequence += 1;
        self.position
            .store(writer.active().position(), Ordering::Release);
        self.index.write().apply(&record);

        tracing::debug!(
            "Journaled {} for {} ({} resources)",
            status,
            txn_id,
            record.unique_names.len()
        );
        Ok(())
    }

    fn force(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.check_writable(&writer)?;
        writer.active().sync().map_err(|e| self.fail(e))
    }

    fn collect_dangling_records(&self) -> Result<DanglingRecords> {
        if self.failed.load(Ordering::Acquire) {
            return Err(JournalError::Failed);
        }
        Ok(DanglingRecords::new(self.index.read().dangling()))
    }

    fn needs_rotation(&self) -> bool {
        let position = self.position.load(Ordering::Acquire);
        position as f64 >= self.config.segment_capacity as f64 * self.config.rotation_threshold
    }

    fn rotate(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.check_writable(&writer)?;
        self.rotate_locked(&mut writer).map_err(|e| self.fail(e))
    }

    fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.closed {
            return Ok(());
        }
        writer.closed = true;
        if !self.failed.load(Ordering::Acquire) {
            writer.active().sync()?;
        }
        tracing::info!("Closed journal {:?}", self.config.directory);
        Ok(())
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::PathBuf;
    use tandem_common::NodeId;

    fn temp_dir() -> PathBuf {
        env::temp_dir().join(format!("journal_test_{}", uuid::Uuid::new_v4()))
    }

    fn txn(n: u64) -> TransactionId {
        TransactionId::new(1_000 + n, 0, NodeId::new(1))
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dangling_survives_restart() {
        let dir = temp_dir();
        {
            let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
            journal
                .log(RecordStatus::Committing, txn(1), &names(&["a", "b"]))
                .unwrap();
            journal
                .log(RecordStatus::Committing, txn(2), &names(&["a"]))
                .unwrap();
            journal
                .log(RecordStatus::Done, txn(2), &names(&["a"]))
                .unwrap();
            journal.log(RecordStatus::Done, txn(1), &names(&["b"])).unwrap();
            journal.close().unwrap();
        }

        let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
        let dangling: Vec<_> = journal.collect_dangling_records().unwrap().collect();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].txn_id, txn(1));
        assert_eq!(dangling[0].unique_names, names(&["a"]));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = temp_dir();
        {
            let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
            journal
                .log(RecordStatus::Committing, txn(1), &names(&["a"]))
                .unwrap();
            journal.close().unwrap();
        }

        // Half of a frame, as left by a crash mid-write
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.join("part1.tlog"))
            .unwrap();
        file.write_all(&[40, 0, 0, 0, 3, 0, 0]).unwrap();
        drop(file);

        let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
        assert_eq!(journal.read_records().unwrap().len(), 1);
        assert_eq!(journal.collect_dangling_records().unwrap().count(), 1);

        // The journal keeps accepting writes after the cut
        journal.log(RecordStatus::Done, txn(1), &names(&["a"])).unwrap();
        assert_eq!(journal.collect_dangling_records().unwrap().count(), 0);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_record_cuts_the_segment() {
        let dir = temp_dir();
        {
            let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
            for n in 1..=3 {
                journal
                    .log(RecordStatus::Committing, txn(n), &names(&["a"]))
                    .unwrap();
            }
            journal.close().unwrap();
        }

        // Flip one payload byte of the second record
        let path = dir.join("part1.tlog");
        let mut bytes = fs::read(&path).unwrap();
        let first = HEADER_SIZE as usize;
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[first..first + 4]);
        let second = first + 4 + u32::from_le_bytes(len) as usize + 4;
        bytes[second + 6] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
        let dangling: Vec<_> = journal.collect_dangling_records().unwrap().collect();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].txn_id, txn(1));
        assert_eq!(fs::metadata(&path).unwrap().len(), second as u64);

        journal
            .log(RecordStatus::Committing, txn(4), &names(&["b"]))
            .unwrap();
        journal.close().unwrap();
        drop(journal);

        let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
        let records = journal.read_records().unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.txn_id).collect();
        assert_eq!(ids, [txn(1), txn(4)]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_interrupted_rotation_keeps_old_segment() {
        let dir = temp_dir();
        {
            let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
            journal
                .log(RecordStatus::Committing, txn(1), &names(&["a"]))
                .unwrap();
            journal.close().unwrap();
        }

        // The copy into the other segment got as far as one record, but the
        // process died before the header was promoted.
        {
            let (mut target, _) = Segment::open(&dir.join("part2.tlog")).unwrap();
            target.reset(0).unwrap();
            let copied = JournalRecord {
                status: RecordStatus::Committing,
                txn_id: txn(9),
                sequence: 1,
                time: 0,
                unique_names: names(&["z"]),
            };
            target.append(&copied.encode().unwrap(), true).unwrap();
        }

        let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
        let dangling: Vec<_> = journal.collect_dangling_records().unwrap().collect();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].txn_id, txn(1));

        // A completed rotation takes over from the old segment
        journal.rotate().unwrap();
        journal.close().unwrap();
        drop(journal);

        let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
        let records = journal.read_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].txn_id, txn(1));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_keeps_unresolved_records() {
        let dir = temp_dir();
        let config = JournalConfig::new(&dir).with_segment_capacity(4 * 1024);
        {
            let journal = DiskJournal::open(config.clone()).unwrap();
            journal
                .log(RecordStatus::Committing, txn(0), &names(&["stuck"]))
                .unwrap();

            // Plenty of resolved traffic, enough to wrap the segment several times
            for n in 1..200 {
                journal
                    .log(RecordStatus::Committing, txn(n), &names(&["a", "b"]))
                    .unwrap();
                journal
                    .log(RecordStatus::Done, txn(n), &names(&["a", "b"]))
                    .unwrap();
            }
            journal.close().unwrap();
        }

        let journal = DiskJournal::open(config).unwrap();
        let dangling: Vec<_> = journal.collect_dangling_records().unwrap().collect();
        assert_eq!(dangling.len(), 1);
        assert_eq!(dangling[0].txn_id, txn(0));
        assert_eq!(dangling[0].unique_names, names(&["stuck"]));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_explicit_rotation() {
        let dir = temp_dir();
        let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
        journal
            .log(RecordStatus::Committing, txn(1), &names(&["a"]))
            .unwrap();
        journal
            .log(RecordStatus::Committing, txn(2), &names(&["a"]))
            .unwrap();
        journal.log(RecordStatus::Done, txn(2), &names(&["a"])).unwrap();

        journal.rotate().unwrap();

        let records = journal.read_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].txn_id, txn(1));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_writes_after_close_fail() {
        let dir = temp_dir();
        let journal = DiskJournal::open(JournalConfig::new(&dir)).unwrap();
        journal.close().unwrap();

        let result = journal.log(RecordStatus::Committing, txn(1), &names(&["a"]));
        assert!(matches!(result, Err(JournalError::Closed)));

        let _ = fs::remove_dir_all(&dir);
    }
}
