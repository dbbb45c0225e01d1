//! Data models for ydl-dl

pub mod file_info;
pub mod quality;
pub mod snapshot;
pub mod tags;
pub mod task;

pub use file_info::{FileInfo, FileStatus, FINAL_ARCHIVE_NAME};
pub use quality::AudioQuality;
pub use snapshot::BatchSnapshot;
pub use tags::{RawTrackInfo, TagSet};
pub use task::{Owner, Task, TaskKind, TaskStatus};
