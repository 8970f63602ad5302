//! Error types for the journal

use thiserror::Error;

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, JournalError>;

/// Journal errors
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An earlier write failed; durability can no longer be guaranteed.
    #[error("Journal failed earlier and no longer accepts writes")]
    Failed,

    #[error("Journal is closed")]
    Closed,

    #[error("Record of {size} bytes does not fit in a segment of {capacity} bytes")]
    RecordTooLarge { size: usize, capacity: u64 },

    #[error("Segment full: {dangling} dangling records leave no room after rotation")]
    SegmentFull { dangling: usize },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Corrupt segment {path}: {reason}")]
    Corrupt { path: String, reason: String },
}
