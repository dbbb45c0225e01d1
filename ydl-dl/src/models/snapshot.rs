//! Batch resumption snapshot
//!
//! Invocation parameters of a batch, written next to its part archives as
//! `kwargs` before any network activity and read back on restart.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::models::AudioQuality;

/// File name of the snapshot inside a task's working directory
pub const SNAPSHOT_FILE_NAME: &str = "kwargs";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    /// Task working directory
    pub dir: PathBuf,
    pub quality: AudioQuality,
    pub repair_tags: bool,
    pub part_size: usize,
    #[serde(default = "default_send_mails")]
    pub send_mails: bool,
}

fn default_send_mails() -> bool {
    true
}

impl BatchSnapshot {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(SNAPSHOT_FILE_NAME)
    }

    /// Write atomically: temp file, fsync, rename
    pub async fn save(&self) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let target = Self::path_in(&self.dir);
        let temp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE_NAME));

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &target).await
    }

    pub async fn load(dir: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(Self::path_in(dir)).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
