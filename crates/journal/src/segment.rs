//! One of the two alternating segment files
//!
//! Header layout (32 bytes, little-endian):
//! ```text
//! magic "TJNL" | version u16 | generation u64 | crc32 of the previous 14 bytes | zero padding
//! ```
//! A generation of zero marks a segment that is being filled by a rotation
//! and must not be trusted yet.

use crate::error::Result;
use crate::record::{FrameRead, JournalRecord, read_frame};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const HEADER_SIZE: u64 = 32;
const MAGIC: &[u8; 4] = b"TJNL";
const VERSION: u16 = 1;

/// Records recovered from a segment and where the valid data ends.
pub(crate) struct Scan {
    pub records: Vec<JournalRecord>,
    pub valid_end: u64,
    pub file_len: u64,
}

pub(crate) struct Segment {
    path: PathBuf,
    file: File,
    generation: u64,
    position: u64,
}

impl Segment {
    /// Open or create the segment file. The generation is `None` when the
    /// header is missing or invalid.
    pub(crate) fn open(path: &Path) -> Result<(Self, Option<u64>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut header = Vec::with_capacity(HEADER_SIZE as usize);
        (&file).take(HEADER_SIZE).read_to_end(&mut header)?;
        let generation = decode_header(&header);

        let segment = Self {
            path: path.to_path_buf(),
            file,
            generation: generation.unwrap_or(0),
            position: HEADER_SIZE,
        };
        Ok((segment, generation))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    /// Read every valid record after the header. Reading stops at the first
    /// torn, corrupt or out-of-order frame; anything after it is garbage.
    pub(crate) fn scan(&self) -> Result<Scan> {
        let bytes = fs::read(&self.path)?;
        let file_len = bytes.len() as u64;
        let mut records = Vec::new();
        let mut offset = HEADER_SIZE as usize;
        let mut last_sequence = 0u64;

        while offset < bytes.len() {
            match read_frame(&bytes[offset..]) {
                FrameRead::Record { record, len } => {
                    if record.sequence <= last_sequence {
                        tracing::warn!(
                            "Journal {:?}: sequence {} after {} at offset {}, ignoring the rest",
                            self.path,
                            record.sequence,
                            last_sequence,
                            offset
                        );
                        break;
                    }
                    last_sequence = record.sequence;
                    records.push(record);
                    offset += len;
                }
                FrameRead::Truncated => break,
                FrameRead::Corrupt(reason) => {
                    tracing::warn!(
                        "Journal {:?}: corrupt record at offset {} ({}), ignoring the rest",
                        self.path,
                        offset,
                        reason
                    );
                    break;
                }
            }
        }

        Ok(Scan {
            records,
            valid_end: (offset as u64).min(file_len).max(HEADER_SIZE),
            file_len,
        })
    }

    /// Drop everything past `end` and continue writing there.
    pub(crate) fn truncate_to(&mut self, end: u64) -> Result<()> {
        self.file.set_len(end)?;
        self.file.sync_data()?;
        self.position = end;
        Ok(())
    }

    /// Empty the segment and give it a fresh header.
    pub(crate) fn reset(&mut self, generation: u64) -> Result<()> {
        self.file.set_len(0)?;
        self.write_header(generation)?;
        self.position = HEADER_SIZE;
        Ok(())
    }

    pub(crate) fn write_header(&mut self, generation: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&encode_header(generation))?;
        self.generation = generation;
        Ok(())
    }

    pub(crate) fn append(&mut self, bytes: &[u8], sync: bool) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(bytes)?;
        if sync {
            self.file.sync_data()?;
        }
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn encode_header(generation: u64) -> [u8; HEADER_SIZE as usize] {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6..14].copy_from_slice(&generation.to_le_bytes());
    let crc = crc32fast::hash(&header[0..14]);
    header[14..18].copy_from_slice(&crc.to_le_bytes());
    header
}

fn decode_header(bytes: &[u8]) -> Option<u64> {
    if bytes.len() < HEADER_SIZE as usize || &bytes[0..4] != MAGIC {
        return None;
    }

    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[14..18]);
    if crc32fast::hash(&bytes[0..14]) != u32::from_le_bytes(crc) {
        return None;
    }

    let mut version = [0u8; 2];
    version.copy_from_slice(&bytes[4..6]);
    if u16::from_le_bytes(version) != VERSION {
        return None;
    }

    let mut generation = [0u8; 8];
    generation.copy_from_slice(&bytes[6..14]);
    Some(u64::from_le_bytes(generation))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = encode_header(9);
        assert_eq!(decode_header(&header), Some(9));
    }

    #[test]
    fn test_header_rejects_damage() {
        let mut header = encode_header(9);
        header[7] ^= 0x01;
        assert_eq!(decode_header(&header), None);
        assert_eq!(decode_header(&header[..10]), None);
    }
}
