//! Inbound download operations
//!
//! Owner-scoped entry points used by the HTTP layer: start a single or
//! batch download, poll status, and pick up a ready archive.

use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use ydl_common::events::EventBus;

use crate::db::{files, tasks};
use crate::models::task::{progress, task_dir};
use crate::models::{AudioQuality, Owner, Task, TaskKind};
use crate::services::executor::Executor;
use crate::services::fetcher::{FetchError, ItemFetcher, TaskContext};
use crate::services::orchestrator::{BatchOrchestrator, BatchRequest};
use crate::services::resolver::ResolveError;

#[derive(Debug, Error)]
pub enum DownloadsError {
    #[error("{0}")]
    AlreadyRunning(String),

    #[error("No task for this owner")]
    NoTask,

    #[error("No archive is waiting for pickup")]
    NotReady,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Common(#[from] ydl_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DownloadsResult<T> = Result<T, DownloadsError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatusView {
    pub task_id: i64,
    pub status_code: i64,
    pub progress: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchProgressView {
    pub task_id: i64,
    pub status_code: i64,
    pub progress: String,
    /// Status code of every item, in submission order
    pub items: Vec<i64>,
}

/// Converted single item
#[derive(Debug)]
pub struct SingleDownload {
    pub task: Task,
    pub path: PathBuf,
}

/// Open handle on a picked-up archive
#[derive(Debug)]
pub struct ReadyArchive {
    pub task_id: i64,
    pub file: tokio::fs::File,
    pub file_name: String,
    pub size: u64,
}

/// Batch submission options
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub quality: AudioQuality,
    pub repair_tags: bool,
    pub part_size: usize,
    pub send_mails: bool,
}

pub struct Downloads {
    db: SqlitePool,
    event_bus: EventBus,
    fetcher: Arc<ItemFetcher>,
    orchestrator: Arc<BatchOrchestrator>,
    executor: Arc<Executor>,
    download_root: PathBuf,
}

impl Downloads {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        fetcher: Arc<ItemFetcher>,
        orchestrator: Arc<BatchOrchestrator>,
        executor: Arc<Executor>,
    ) -> Self {
        let download_root = orchestrator.download_root().to_path_buf();
        Self {
            db,
            event_bus,
            fetcher,
            orchestrator,
            executor,
            download_root,
        }
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    async fn ensure_idle(&self, owner: &Owner) -> DownloadsResult<()> {
        match tasks::find_active_task(&self.db, owner).await? {
            Some(active) => Err(DownloadsError::AlreadyRunning(format!(
                "Task {} is still running",
                active.id
            ))),
            None => Ok(()),
        }
    }

    /// Claim the owner's single running slot
    async fn claim_task(&self, owner: &Owner, kind: TaskKind) -> DownloadsResult<Task> {
        self.ensure_idle(owner).await?;
        tasks::create_task(&self.db, owner, kind)
            .await?
            .ok_or_else(|| DownloadsError::AlreadyRunning("Another task was just started".to_string()))
    }

    /// Download and convert one item within the request
    ///
    /// The task ends COMPLETED with the file left in its working directory
    /// for the junk grace period, or ERROR with the failure as progress.
    pub async fn start_single_download(
        &self,
        url: &str,
        owner: &Owner,
        quality: AudioQuality,
        repair_tags: bool,
    ) -> DownloadsResult<SingleDownload> {
        let task = self.claim_task(owner, TaskKind::Single).await?;
        let dir = task.working_dir(&self.download_root);
        let context = TaskContext {
            db: self.db.clone(),
            task_id: task.id,
            event_bus: self.event_bus.clone(),
        };

        info!(task_id = task.id, %owner, url, "Single download started");
        match self
            .fetcher
            .fetch(url, &dir, quality, repair_tags, Some(&context))
            .await
        {
            Ok(path) => {
                tasks::mark_completed(&self.db, task.id, progress::DONE).await?;
                let task = tasks::load_task(&self.db, task.id).await?.unwrap_or(task);
                Ok(SingleDownload { task, path })
            }
            Err(e) => {
                tasks::mark_failed(&self.db, task.id, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    /// Register a batch and hand it to the executor
    ///
    /// Returns the task as it stands after submission: still running for
    /// detached backends, already finished for the inline one.
    pub async fn start_batch_download(
        &self,
        item_ids: Vec<String>,
        owner: &Owner,
        options: BatchOptions,
    ) -> DownloadsResult<Task> {
        let request = BatchRequest {
            item_ids,
            quality: options.quality,
            repair_tags: options.repair_tags,
            part_size: options.part_size,
            send_mails: options.send_mails,
        };
        request
            .validate()
            .map_err(|e| DownloadsError::InvalidInput(e.to_string()))?;

        let task = self.claim_task(owner, TaskKind::Batch).await?;
        let dir = task_dir(&self.download_root, owner, task.id);
        info!(task_id = task.id, %owner, items = request.item_ids.len(), "Batch download submitted");

        let orchestrator = Arc::clone(&self.orchestrator);
        let submitted = task.clone();
        self.executor
            .submit(Box::pin(async move {
                orchestrator.start_batch(&submitted, &dir, request).await;
            }))
            .await;

        Ok(tasks::load_task(&self.db, task.id).await?.unwrap_or(task))
    }

    /// Enumerate `[start, end)` of a playlist and submit it as a batch
    pub async fn start_playlist_download(
        &self,
        playlist_url: &str,
        start: i64,
        end: i64,
        owner: &Owner,
        options: BatchOptions,
    ) -> DownloadsResult<Task> {
        self.ensure_idle(owner).await?;
        let item_ids = self
            .fetcher
            .resolver()
            .enumerate_playlist(playlist_url, start, end)
            .await?;
        self.start_batch_download(item_ids, owner, options).await
    }

    pub async fn get_task_status(&self, owner: &Owner) -> DownloadsResult<TaskStatusView> {
        let task = tasks::find_latest_task(&self.db, owner)
            .await?
            .ok_or(DownloadsError::NoTask)?;
        Ok(TaskStatusView {
            task_id: task.id,
            status_code: task.status.code(),
            progress: task.progress,
        })
    }

    pub async fn get_batch_progress(&self, owner: &Owner) -> DownloadsResult<BatchProgressView> {
        let task = tasks::find_latest_task(&self.db, owner)
            .await?
            .ok_or(DownloadsError::NoTask)?;
        let items = files::item_status_codes(&self.db, task.id).await?;
        Ok(BatchProgressView {
            task_id: task.id,
            status_code: task.status.code(),
            progress: task.progress,
            items,
        })
    }

    /// Open the owner's ready archive and mark the task COMPLETED
    pub async fn fetch_ready_archive(&self, owner: &Owner) -> DownloadsResult<ReadyArchive> {
        let task = tasks::find_ready_task(&self.db, owner)
            .await?
            .ok_or(DownloadsError::NotReady)?;
        let path = task
            .unique_process_info
            .as_deref()
            .map(PathBuf::from)
            .ok_or(DownloadsError::NotReady)?;

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tasks::mark_failed(&self.db, task.id, "Archive missing").await?;
                return Err(DownloadsError::NotReady);
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        tasks::mark_completed(&self.db, task.id, progress::DONE).await?;
        info!(task_id = task.id, %owner, size, "Archive picked up");

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| crate::models::FINAL_ARCHIVE_NAME.to_string());
        Ok(ReadyArchive {
            task_id: task.id,
            file,
            file_name,
            size,
        })
    }
}
