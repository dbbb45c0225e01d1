//! Per-item and per-archive ledger records

use serde::{Deserialize, Serialize};

/// Index reserved for part and final archive markers
pub const ARCHIVE_MARKER_INDEX: i64 = 0;

/// File name of the merged batch archive
pub const FINAL_ARCHIVE_NAME: &str = "playlist.zip";

/// File name of part `n` (1-based)
pub fn part_archive_name(part: usize) -> String {
    format!("part{}.zip", part)
}

/// Item processing status, persisted as its numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    NotProcessed,
    Processed,
    ProcessingError,
}

impl FileStatus {
    pub fn code(self) -> i64 {
        match self {
            FileStatus::NotProcessed => 0,
            FileStatus::Processed => 1,
            FileStatus::ProcessingError => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(FileStatus::NotProcessed),
            1 => Some(FileStatus::Processed),
            2 => Some(FileStatus::ProcessingError),
            _ => None,
        }
    }
}

/// One tracked item (index 1..N) or archive marker (index 0)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub id: i64,
    pub task_id: i64,
    pub index: i64,
    /// Remote item id, or archive file name for markers
    pub file_id: String,
    pub status: FileStatus,
    pub file_hash: Option<String>,
}

impl FileInfo {
    pub fn is_archive_marker(&self) -> bool {
        self.index == ARCHIVE_MARKER_INDEX
    }
}
