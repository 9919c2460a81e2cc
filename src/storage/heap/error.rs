use std::fmt;

use crate::common::PageNo;
use crate::storage::SlotNo;

/// Errors a heap-file operation surfaces to its caller. Failures of the
/// buffer or disk layer propagate separately as plain [anyhow] errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapFileError {
    /// The record does not fit on a single data page.
    RecordTooLarge { size: usize, max: usize },
    /// The record id does not name a live record of this heap file.
    InvalidRid { page_no: PageNo, slot: SlotNo },
    /// In-place updates must keep the record length unchanged.
    RecordLengthMismatch { expected: usize, actual: usize },
}

impl fmt::Display for HeapFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapFileError::RecordTooLarge { size, max } => {
                write!(f, "record of {} bytes exceeds the page limit of {}", size, max)
            }
            HeapFileError::InvalidRid { page_no, slot } => {
                write!(f, "no record at page {} slot {}", page_no, slot)
            }
            HeapFileError::RecordLengthMismatch { expected, actual } => {
                write!(
                    f,
                    "record length must stay {} bytes for an in-place update, got {}",
                    expected, actual
                )
            }
        }
    }
}

impl std::error::Error for HeapFileError {}
