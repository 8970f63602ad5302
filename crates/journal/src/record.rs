//! Journal records and their on-disk encoding
//!
//! Frame layout:
//! ```text
//! +-----------------+------------------+-----------------+
//! | payload_len u32 | payload          | crc32 u32       |
//! +-----------------+------------------+-----------------+
//!
//! Payload (big-endian):
//! - status: 1 byte (COMMITTING=1, ROLLING_BACK=2, DONE=3)
//! - transaction id: 20 bytes
//! - sequence: 8 bytes
//! - time: 8 bytes (microseconds since the Unix epoch)
//! - name count: 2 bytes
//! - names: (len: 2 bytes, utf-8 bytes)*
//! ```
//! Lengths and the checksum are little-endian; the checksum covers the payload.

use std::collections::BTreeSet;
use std::fmt;
use std::io::{Cursor, Read};
use tandem_common::{TRANSACTION_ID_LEN, TransactionId};

/// Bytes of framing around each payload
pub const FRAME_OVERHEAD: usize = 8;

/// Type of a journal record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordStatus {
    /// Commit decision: every listed branch must be committed
    Committing = 1,
    /// Rollback decision: every listed branch must be rolled back
    RollingBack = 2,
    /// The listed branches are resolved
    Done = 3,
}

impl RecordStatus {
    /// Whether this record fixes the fate of the transaction.
    pub fn is_decision(self) -> bool {
        matches!(self, RecordStatus::Committing | RecordStatus::RollingBack)
    }
}

impl TryFrom<u8> for RecordStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordStatus::Committing),
            2 => Ok(RecordStatus::RollingBack),
            3 => Ok(RecordStatus::Done),
            _ => Err(format!("Unknown record status: {}", value)),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordStatus::Committing => "committing",
            RecordStatus::RollingBack => "rollingback",
            RecordStatus::Done => "done",
        };
        f.write_str(name)
    }
}

/// One immutable journal entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub status: RecordStatus,
    pub txn_id: TransactionId,
    pub sequence: u64,
    pub time: u64,
    pub unique_names: BTreeSet<String>,
}

impl JournalRecord {
    /// Encode as a checksummed frame.
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        let mut payload = Vec::with_capacity(64);
        payload.push(self.status as u8);
        payload.extend_from_slice(&self.txn_id.to_bytes());
        payload.extend_from_slice(&self.sequence.to_be_bytes());
        payload.extend_from_slice(&self.time.to_be_bytes());

        let count = u16::try_from(self.unique_names.len())
            .map_err(|_| format!("Too many resource names: {}", self.unique_names.len()))?;
        payload.extend_from_slice(&count.to_be_bytes());

        for name in &self.unique_names {
            let len = u16::try_from(name.len())
                .map_err(|_| format!("Resource name too long: {} bytes", name.len()))?;
            payload.extend_from_slice(&len.to_be_bytes());
            payload.extend_from_slice(name.as_bytes());
        }

        let payload_len = u32::try_from(payload.len())
            .map_err(|_| format!("Record too large: {} bytes", payload.len()))?;

        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(frame)
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, String> {
        let mut cursor = Cursor::new(payload);

        let mut status = [0u8; 1];
        cursor.read_exact(&mut status).map_err(|e| e.to_string())?;
        let status = RecordStatus::try_from(status[0])?;

        let mut txn_id = [0u8; TRANSACTION_ID_LEN];
        cursor.read_exact(&mut txn_id).map_err(|e| e.to_string())?;
        let txn_id = TransactionId::from_bytes(&txn_id)?;

        let mut u64_bytes = [0u8; 8];
        cursor
            .read_exact(&mut u64_bytes)
            .map_err(|e| e.to_string())?;
        let sequence = u64::from_be_bytes(u64_bytes);
        cursor
            .read_exact(&mut u64_bytes)
            .map_err(|e| e.to_string())?;
        let time = u64::from_be_bytes(u64_bytes);

        let mut u16_bytes = [0u8; 2];
        cursor
            .read_exact(&mut u16_bytes)
            .map_err(|e| e.to_string())?;
        let count = u16::from_be_bytes(u16_bytes);

        let mut unique_names = BTreeSet::new();
        for _ in 0..count {
            cursor
                .read_exact(&mut u16_bytes)
                .map_err(|e| e.to_string())?;
            let mut name = vec![0u8; u16::from_be_bytes(u16_bytes) as usize];
            cursor.read_exact(&mut name).map_err(|e| e.to_string())?;
            unique_names
                .insert(String::from_utf8(name).map_err(|e| format!("Invalid UTF-8: {}", e))?);
        }

        if cursor.position() as usize != payload.len() {
            return Err("Trailing bytes after record payload".to_string());
        }

        Ok(Self {
            status,
            txn_id,
            sequence,
            time,
            unique_names,
        })
    }
}

/// Result of reading one frame from a byte buffer
#[derive(Debug)]
pub enum FrameRead {
    /// A valid record spanning `len` bytes
    Record { record: JournalRecord, len: usize },
    /// The buffer ends inside a frame (partial write)
    Truncated,
    /// The frame is complete but invalid
    Corrupt(String),
}

/// Read the frame starting at the beginning of `buf`.
pub fn read_frame(buf: &[u8]) -> FrameRead {
    if buf.len() < FRAME_OVERHEAD {
        return FrameRead::Truncated;
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[0..4]);
    let payload_len = u32::from_le_bytes(len_bytes) as usize;
    if payload_len == 0 {
        // zero-filled tail, never written
        return FrameRead::Truncated;
    }

    let total = payload_len + FRAME_OVERHEAD;
    if buf.len() < total {
        return FrameRead::Truncated;
    }

    let payload = &buf[4..4 + payload_len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&buf[4 + payload_len..total]);
    if crc32fast::hash(payload) != u32::from_le_bytes(crc_bytes) {
        return FrameRead::Corrupt("checksum mismatch".to_string());
    }

    match JournalRecord::decode_payload(payload) {
        Ok(record) => FrameRead::Record { record, len: total },
        Err(reason) => FrameRead::Corrupt(reason),
    }
}
