//! Batch orchestrator
//!
//! Drives a batch through its states:
//!
//! ```text
//! PREPARING -> DOWNLOADING(part i) -> HASHING(part i) -> ... -> MERGING -> READY
//!                                                                  \-> FAILED
//! ```
//!
//! Items are processed strictly in order, one part archive per
//! `part_size` items. A part's archive hash, stored once the part closes,
//! is the only resume checkpoint: on restart the longest prefix of parts
//! whose on-disk archives still match their stored hashes is kept and
//! everything after it is downloaded again.
//!
//! Per-item failures are recorded on the item and never stop the batch.
//! Archive, snapshot and ledger failures are fatal and move the task to
//! ERROR.

use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use ydl_common::events::{DownloadEvent, EventBus};
use ydl_common::time::now;

use crate::db::{files, tasks};
use crate::models::file_info::part_archive_name;
use crate::models::task::progress;
use crate::models::{AudioQuality, BatchSnapshot, FileInfo, FileStatus, Task, TaskStatus, FINAL_ARCHIVE_NAME};
use crate::services::archive::{self, ArchiveError, PartArchive};
use crate::services::fetcher::ItemFetcher;
use crate::services::notifier::{failure_links, Notifier};
use crate::services::resolver::item_url;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Invalid batch: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("Failed to persist batch parameters: {0}")]
    Snapshot(#[source] std::io::Error),

    #[error("Working directory error: {0}")]
    WorkingDir(#[source] std::io::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] ydl_common::Error),
}

/// Number of parts for `len` items: `ceil(len / part_size)`
pub fn part_count(len: usize, part_size: usize) -> usize {
    if part_size == 0 {
        return 0;
    }
    len.div_ceil(part_size)
}

/// Contiguous parts of at most `part_size` items, in order
pub fn partition<T>(items: &[T], part_size: usize) -> Vec<&[T]> {
    if part_size == 0 {
        return Vec::new();
    }
    items.chunks(part_size).collect()
}

/// Parameters of a new batch
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub item_ids: Vec<String>,
    pub quality: AudioQuality,
    pub repair_tags: bool,
    pub part_size: usize,
    pub send_mails: bool,
}

impl BatchRequest {
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.item_ids.is_empty() {
            return Err(BatchError::InvalidInput("No items to download".to_string()));
        }
        if self.part_size == 0 {
            return Err(BatchError::InvalidInput("Part size must be positive".to_string()));
        }
        Ok(())
    }
}

pub struct BatchOrchestrator {
    db: SqlitePool,
    event_bus: EventBus,
    fetcher: Arc<ItemFetcher>,
    notifier: Arc<dyn Notifier>,
    download_root: PathBuf,
    item_delay: Duration,
}

impl BatchOrchestrator {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        fetcher: Arc<ItemFetcher>,
        notifier: Arc<dyn Notifier>,
        download_root: PathBuf,
        item_delay: Duration,
    ) -> Self {
        Self {
            db,
            event_bus,
            fetcher,
            notifier,
            download_root,
            item_delay,
        }
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Persist parameters and create ledger records; no network activity
    ///
    /// Leaves the task RUNNING_LONG_TERM with progress "Waiting".
    pub async fn prepare(&self, task: &Task, dir: &Path, request: &BatchRequest) -> Result<BatchSnapshot, BatchError> {
        request.validate()?;

        tokio::fs::create_dir_all(dir).await.map_err(BatchError::WorkingDir)?;
        let snapshot = BatchSnapshot {
            dir: dir.to_path_buf(),
            quality: request.quality,
            repair_tags: request.repair_tags,
            part_size: request.part_size,
            send_mails: request.send_mails,
        };
        snapshot.save().await.map_err(BatchError::Snapshot)?;

        let parts = part_count(request.item_ids.len(), request.part_size);
        files::create_batch_records(&self.db, task.id, &request.item_ids, parts).await?;
        tasks::set_status(&self.db, task.id, TaskStatus::RunningLongTerm).await?;
        self.report(task.id, progress::WAITING).await?;

        info!(
            task_id = task.id,
            items = request.item_ids.len(),
            parts,
            dir = %dir.display(),
            "Batch prepared"
        );
        Ok(snapshot)
    }

    /// Prepare and run a new batch; the outcome lands in the ledger
    pub async fn start_batch(&self, task: &Task, dir: &Path, request: BatchRequest) {
        if let Err(e) = self.try_start(task, dir, &request).await {
            self.fail(task, &e, request.send_mails).await;
        }
    }

    async fn try_start(&self, task: &Task, dir: &Path, request: &BatchRequest) -> Result<(), BatchError> {
        let snapshot = self.prepare(task, dir, request).await?;
        let items = files::items_for_task(&self.db, task.id).await?;
        self.run(task, &snapshot, &items, 1).await
    }

    /// Continue an interrupted batch from its last verified part
    pub async fn resume_batch(&self, task: &Task) {
        let dir = task.working_dir(&self.download_root);
        let snapshot = match BatchSnapshot::load(&dir).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.fail(task, &BatchError::Snapshot(e), true).await;
                return;
            }
        };

        if let Err(e) = self.try_resume(task, &snapshot).await {
            self.fail(task, &e, snapshot.send_mails).await;
        }
    }

    async fn try_resume(&self, task: &Task, snapshot: &BatchSnapshot) -> Result<(), BatchError> {
        let items = files::items_for_task(&self.db, task.id).await?;
        let final_path = snapshot.dir.join(FINAL_ARCHIVE_NAME);

        if self.archive_verified(task.id, FINAL_ARCHIVE_NAME, &final_path).await? {
            info!(task_id = task.id, "Final archive intact, finishing batch");
            return self.finish_ready(task, snapshot, &final_path, items.len()).await;
        }

        let parts = part_count(items.len(), snapshot.part_size);
        let mut verified = 0;
        for part in 1..=parts {
            let name = part_archive_name(part);
            if !self.archive_verified(task.id, &name, &snapshot.dir.join(&name)).await? {
                break;
            }
            verified = part;
        }

        info!(
            task_id = task.id,
            verified_parts = verified,
            parts,
            "Resuming batch"
        );
        self.run(task, snapshot, &items, verified + 1).await
    }

    /// Stored hash exists and the file on disk still matches it
    async fn archive_verified(&self, task_id: i64, name: &str, path: &Path) -> Result<bool, BatchError> {
        let stored = files::archive_record(&self.db, task_id, name)
            .await?
            .and_then(|record| record.file_hash);
        Ok(match stored {
            Some(hash) => archive::verify_hash(path, &hash).await,
            None => false,
        })
    }

    /// Download parts `first_part..` of `items`, then merge and finish
    async fn run(
        &self,
        task: &Task,
        snapshot: &BatchSnapshot,
        items: &[FileInfo],
        first_part: usize,
    ) -> Result<(), BatchError> {
        let total = items.len();
        let parts = partition(items, snapshot.part_size);

        self.report(task.id, progress::PREPARING).await?;

        let mut counter = (first_part - 1) * snapshot.part_size;
        for (offset, part_items) in parts.iter().enumerate().skip(first_part - 1) {
            let part = offset + 1;
            let pause_first = part > first_part;
            self.download_part(task, snapshot, part, part_items, &mut counter, total, pause_first)
                .await?;
        }

        self.report(task.id, progress::MERGING).await?;
        let part_paths: Vec<PathBuf> = (1..=parts.len())
            .map(|part| snapshot.dir.join(part_archive_name(part)))
            .collect();
        let final_path = snapshot.dir.join(FINAL_ARCHIVE_NAME);

        let merge_parts = part_paths.clone();
        let merge_dest = final_path.clone();
        let entries = tokio::task::spawn_blocking(move || archive::merge_parts(&merge_parts, &merge_dest))
            .await
            .map_err(|e| ArchiveError::Join(e.to_string()))??;

        let hash = archive::hash_file(&final_path).await?;
        files::set_archive_hash(&self.db, task.id, FINAL_ARCHIVE_NAME, &hash).await?;
        debug!(task_id = task.id, entries, %hash, "Final archive written");

        for path in &part_paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove part archive");
            }
        }

        self.finish_ready(task, snapshot, &final_path, total).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_part(
        &self,
        task: &Task,
        snapshot: &BatchSnapshot,
        part: usize,
        items: &[FileInfo],
        counter: &mut usize,
        total: usize,
        pause_first: bool,
    ) -> Result<(), BatchError> {
        let name = part_archive_name(part);
        let path = snapshot.dir.join(&name);
        info!(task_id = task.id, part, items = items.len(), "Downloading part");

        let mut part_archive = PartArchive::create(&path)?;

        for (position, item) in items.iter().enumerate() {
            // Pacing runs across part boundaries, never before the first item of a run
            if position > 0 || pause_first {
                tokio::time::sleep(self.item_delay).await;
            }
            *counter += 1;
            self.report(task.id, &progress::downloading(*counter, total)).await?;

            let url = item_url(&item.file_id);
            let fetched = self
                .fetcher
                .fetch(&url, &snapshot.dir, snapshot.quality, snapshot.repair_tags, None)
                .await;

            let status = match fetched {
                Ok(loose) => {
                    let source = loose.clone();
                    let (returned, added) = tokio::task::spawn_blocking(move || {
                        let added = part_archive.add_file(&source);
                        (part_archive, added)
                    })
                    .await
                    .map_err(|e| ArchiveError::Join(e.to_string()))?;
                    part_archive = returned;
                    let entry = added?;

                    if let Err(e) = tokio::fs::remove_file(&loose).await {
                        warn!(path = %loose.display(), error = %e, "Failed to remove loose file");
                    }
                    debug!(task_id = task.id, index = item.index, %entry, "Item archived");
                    FileStatus::Processed
                }
                Err(e) => {
                    warn!(task_id = task.id, index = item.index, item = %item.file_id, error = %e, "Item failed");
                    FileStatus::ProcessingError
                }
            };

            files::set_item_status(&self.db, task.id, item.index, status).await?;
            self.event_bus.emit_lossy(DownloadEvent::ItemFinished {
                task_id: task.id,
                index: item.index,
                file_id: item.file_id.clone(),
                success: status == FileStatus::Processed,
                timestamp: now(),
            });
        }

        let finished = tokio::task::spawn_blocking(move || part_archive.finish())
            .await
            .map_err(|e| ArchiveError::Join(e.to_string()))??;
        let hash = archive::hash_file(&finished).await?;
        files::set_archive_hash(&self.db, task.id, &name, &hash).await?;

        self.report(task.id, &progress::downloading(*counter, total)).await?;
        self.event_bus.emit_lossy(DownloadEvent::PartCompleted {
            task_id: task.id,
            part,
            hash,
            timestamp: now(),
        });
        Ok(())
    }

    /// Mark the task ready for pickup and notify the owner
    async fn finish_ready(
        &self,
        task: &Task,
        snapshot: &BatchSnapshot,
        final_path: &Path,
        total: usize,
    ) -> Result<(), BatchError> {
        let failed = files::failed_items(&self.db, task.id).await?;
        let absolute = tokio::fs::canonicalize(final_path)
            .await
            .unwrap_or_else(|_| final_path.to_path_buf());
        let archive_path = absolute.to_string_lossy().into_owned();

        tasks::mark_ready(
            &self.db,
            task.id,
            &archive_path,
            &progress::files_downloaded(total, failed.len()),
        )
        .await?;

        info!(task_id = task.id, total, failed = failed.len(), archive = %archive_path, "Batch ready");
        self.event_bus.emit_lossy(DownloadEvent::BatchReady {
            task_id: task.id,
            archive_path,
            failed: failed.len(),
            timestamp: now(),
        });

        if snapshot.send_mails {
            let notifier = Arc::clone(&self.notifier);
            let owner = task.owner.clone();
            let links = failure_links(&failed);
            tokio::spawn(async move { notifier.notify_ready(&owner, &links).await });
        }
        Ok(())
    }

    async fn fail(&self, task: &Task, e: &BatchError, send_mails: bool) {
        let reason = e.to_string();
        error!(task_id = task.id, error = %reason, "Batch failed");

        if let Err(e) = tasks::mark_failed(&self.db, task.id, &reason).await {
            error!(task_id = task.id, error = %e, "Failed to record batch failure");
        }
        self.event_bus.emit_lossy(DownloadEvent::BatchFailed {
            task_id: task.id,
            reason,
            timestamp: now(),
        });

        if send_mails {
            let notifier = Arc::clone(&self.notifier);
            let owner = task.owner.clone();
            tokio::spawn(async move { notifier.notify_failed(&owner).await });
        }
    }

    async fn report(&self, task_id: i64, text: &str) -> Result<(), BatchError> {
        tasks::update_progress(&self.db, task_id, text).await?;
        self.event_bus.emit_lossy(DownloadEvent::TaskProgress {
            task_id,
            progress: text.to_string(),
            timestamp: now(),
        });
        Ok(())
    }
}
