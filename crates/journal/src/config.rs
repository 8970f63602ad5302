//! Journal configuration

use serde::Deserialize;
use std::path::PathBuf;

/// Configuration of the disk journal
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory holding the two segment files
    pub directory: PathBuf,

    /// Maximum size of one segment file in bytes
    pub segment_capacity: u64,

    /// Fill ratio of the active segment past which rotation is requested
    pub rotation_threshold: f64,

    /// Also fsync "done" records (decision records are always synced)
    pub sync_done_records: bool,
}

impl JournalConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn with_segment_capacity(mut self, capacity: u64) -> Self {
        self.segment_capacity = capacity;
        self
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./tandem-journal"),
            segment_capacity: 2 * 1024 * 1024,
            rotation_threshold: 0.75,
            sync_done_records: false,
        }
    }
}
