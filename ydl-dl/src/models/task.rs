//! Task model
//!
//! A task is one unit of user-visible work: a single-item download or a
//! batch. Lifecycle:
//!
//! ```text
//! RUNNING ──► RUNNING_LONG_TERM ──► WAITING_ON_USER ──► COMPLETED
//!    │               │
//!    └───────────────┴──► ERROR
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Task status, persisted as its numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
    RunningLongTerm,
    WaitingOnUser,
}

impl TaskStatus {
    pub fn code(self) -> i64 {
        match self {
            TaskStatus::Running => 0,
            TaskStatus::Completed => 1,
            TaskStatus::Error => 2,
            TaskStatus::RunningLongTerm => 3,
            TaskStatus::WaitingOnUser => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(TaskStatus::Running),
            1 => Some(TaskStatus::Completed),
            2 => Some(TaskStatus::Error),
            3 => Some(TaskStatus::RunningLongTerm),
            4 => Some(TaskStatus::WaitingOnUser),
            _ => None,
        }
    }

    /// Work is still in flight
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::RunningLongTerm)
    }
}

/// Identity a task belongs to; anonymous by IP or authenticated by user id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Ip(String),
    User(i64),
}

impl Owner {
    pub fn user_ip(&self) -> Option<&str> {
        match self {
            Owner::Ip(ip) => Some(ip),
            Owner::User(_) => None,
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            Owner::Ip(_) => None,
            Owner::User(id) => Some(*id),
        }
    }

    /// Filesystem-safe key used as the owner's download directory name
    pub fn dir_key(&self) -> String {
        match self {
            Owner::Ip(ip) => format!(
                "ip-{}",
                ip.chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
                    .collect::<String>()
            ),
            Owner::User(id) => format!("user-{}", id),
        }
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Ip(ip) => write!(f, "ip {}", ip),
            Owner::User(id) => write!(f, "user {}", id),
        }
    }
}

/// What the task downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Single,
    Batch,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Single => "single",
            TaskKind::Batch => "playlist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(TaskKind::Single),
            "playlist" => Some(TaskKind::Batch),
            _ => None,
        }
    }
}

/// Persisted task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub kind: TaskKind,
    pub owner: Owner,
    pub status: TaskStatus,
    /// Human-readable progress, prefix-matched by pollers
    pub progress: String,
    /// Absolute path of the produced artifact once ready
    pub unique_process_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub junk_cleared: bool,
}

impl Task {
    /// Working directory of this task under the download root
    pub fn working_dir(&self, download_root: &Path) -> PathBuf {
        task_dir(download_root, &self.owner, self.id)
    }
}

/// `{download_root}/{owner}/Task{id}`
pub fn task_dir(download_root: &Path, owner: &Owner, task_id: i64) -> PathBuf {
    download_root
        .join(owner.dir_key())
        .join(format!("Task{}", task_id))
}

/// Progress strings shared by the orchestrator, fetcher and pollers
pub mod progress {
    pub const WAITING: &str = "Waiting";
    pub const PREPARING: &str = "Preparing for downloading";
    pub const CONVERTING: &str = "Converting";
    pub const MERGING: &str = "Merging parts";
    pub const DONE: &str = "Done";
    pub const DOWNLOADING_PREFIX: &str = "Downloading";

    pub fn downloading(current: usize, total: usize) -> String {
        format!("{} {} of {}", DOWNLOADING_PREFIX, current, total)
    }

    pub fn downloading_percent(percent: f32, speed: Option<&str>) -> String {
        match speed {
            Some(speed) => format!("{} {:.1}% at {}", DOWNLOADING_PREFIX, percent, speed),
            None => format!("{} {:.1}%", DOWNLOADING_PREFIX, percent),
        }
    }

    pub fn files_downloaded(total: usize, failed: usize) -> String {
        format!("Files downloaded({}) with {} fails", total, failed)
    }
}
