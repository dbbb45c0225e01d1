//! Maintenance scheduler
//!
//! The schedule is plain data: each entry binds a [`JobKind`] to a
//! [`Hook`] (process start, process exit, or a named timer). It can be
//! saved to and loaded from JSON; dispatch is a match on the job kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::tasks;
use crate::models::{TaskKind, TaskStatus};
use crate::services::executor::Executor;
use crate::services::orchestrator::BatchOrchestrator;

pub const MAIN_TIMER: &str = "main_timer";

/// Schedule file kept in the root folder
pub const SCHEDULE_FILE_NAME: &str = "schedule.json";

/// Progress text of tasks stopped because their process died
pub const STOPPED_BY_RESTART: &str = "Stopped: service restarted";

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Timer named {0} is not registered")]
    UnknownTimer(String),

    #[error("Schedule file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schedule format error: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum Hook {
    OnStart,
    OnExit,
    OnTimer { timer: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// RUNNING tasks of a dead process have no checkpoint; mark them ERROR
    StopBrokenTasks,
    /// Delete working directories of finished tasks
    ClearJunk,
    /// Ready archives not picked up within the live time are closed
    CloseExpiredReadyTasks,
    /// Resume every RUNNING_LONG_TERM batch
    ResumeLongTermTasks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    #[serde(flatten)]
    pub hook: Hook,
    pub job: JobKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSpec {
    pub name: String,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub timers: Vec<TimerSpec>,
    pub entries: Vec<ScheduleEntry>,
}

impl Schedule {
    /// Stock maintenance schedule around one main timer
    pub fn standard(main_timer: Duration) -> Self {
        let on_timer = || Hook::OnTimer {
            timer: MAIN_TIMER.to_string(),
        };
        let entry = |hook, job| ScheduleEntry { hook, job };

        Self {
            timers: vec![TimerSpec {
                name: MAIN_TIMER.to_string(),
                interval_secs: main_timer.as_secs().max(1),
            }],
            entries: vec![
                entry(Hook::OnStart, JobKind::StopBrokenTasks),
                entry(Hook::OnStart, JobKind::ClearJunk),
                entry(Hook::OnStart, JobKind::ResumeLongTermTasks),
                entry(on_timer(), JobKind::CloseExpiredReadyTasks),
                entry(on_timer(), JobKind::ClearJunk),
                entry(Hook::OnExit, JobKind::ClearJunk),
            ],
        }
    }

    /// Every timer hook must name a registered timer
    pub fn validate(&self) -> Result<(), SchedulerError> {
        for entry in &self.entries {
            if let Hook::OnTimer { timer } = &entry.hook {
                if !self.timers.iter().any(|t| &t.name == timer) {
                    return Err(SchedulerError::UnknownTimer(timer.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn jobs_for(&self, hook: &Hook) -> Vec<JobKind> {
        self.entries
            .iter()
            .filter(|entry| &entry.hook == hook)
            .map(|entry| entry.job)
            .collect()
    }

    pub async fn save(&self, path: &Path) -> Result<(), SchedulerError> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Self, SchedulerError> {
        let bytes = tokio::fs::read(path).await?;
        let schedule: Schedule = serde_json::from_slice(&bytes)?;
        schedule.validate()?;
        Ok(schedule)
    }

    /// Load `path` when present, otherwise write `fallback` there
    pub async fn load_or_init(path: &Path, fallback: Schedule) -> Result<Self, SchedulerError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Self::load(path).await;
        }
        fallback.validate()?;
        fallback.save(path).await?;
        Ok(fallback)
    }
}

pub struct Scheduler {
    db: SqlitePool,
    orchestrator: Arc<BatchOrchestrator>,
    executor: Arc<Executor>,
    download_root: PathBuf,
    playlist_live_time: Duration,
    single_task_grace: Duration,
    schedule: Schedule,
    /// Tasks created from here on belong to this process
    started_at: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(
        db: SqlitePool,
        orchestrator: Arc<BatchOrchestrator>,
        executor: Arc<Executor>,
        playlist_live_time: Duration,
        single_task_grace: Duration,
        schedule: Schedule,
    ) -> Self {
        let download_root = orchestrator.download_root().to_path_buf();
        Self {
            db,
            orchestrator,
            executor,
            download_root,
            playlist_live_time,
            single_task_grace,
            schedule,
            started_at: ydl_common::time::now(),
        }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Run one job; returns how many tasks it acted on
    pub async fn run_job(&self, job: JobKind) -> ydl_common::Result<u64> {
        let count = match job {
            JobKind::StopBrokenTasks => {
                tasks::stop_running_tasks(&self.db, STOPPED_BY_RESTART, self.started_at).await?
            },
            JobKind::ClearJunk => self.clear_junk().await?,
            JobKind::CloseExpiredReadyTasks => {
                let cutoff = ydl_common::time::seconds_ago(self.playlist_live_time.as_secs());
                tasks::close_expired_ready(&self.db, cutoff).await?
            }
            JobKind::ResumeLongTermTasks => self.resume_long_term_tasks().await?,
        };

        if count > 0 {
            info!(job = ?job, count, "Scheduled job acted on tasks");
        } else {
            debug!(job = ?job, "Scheduled job found nothing to do");
        }
        Ok(count)
    }

    async fn run_hook(&self, hook: &Hook) {
        for job in self.schedule.jobs_for(hook) {
            if let Err(e) = self.run_job(job).await {
                error!(job = ?job, error = %e, "Scheduled job failed");
            }
        }
    }

    pub async fn run_on_start(&self) {
        self.run_hook(&Hook::OnStart).await;
    }

    pub async fn run_on_exit(&self) {
        self.run_hook(&Hook::OnExit).await;
    }

    /// One background loop per timer until `cancel` fires
    pub fn spawn_timers(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.schedule
            .timers
            .iter()
            .map(|timer| {
                let scheduler = Arc::clone(self);
                let cancel = cancel.clone();
                let hook = Hook::OnTimer {
                    timer: timer.name.clone(),
                };
                let period = Duration::from_secs(timer.interval_secs.max(1));
                let name = timer.name.clone();

                tokio::spawn(async move {
                    debug!(timer = %name, period_secs = period.as_secs(), "Timer started");
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(period) => scheduler.run_hook(&hook).await,
                        }
                    }
                    debug!(timer = %name, "Timer stopped");
                })
            })
            .collect()
    }

    async fn clear_junk(&self) -> ydl_common::Result<u64> {
        let grace_cutoff = ydl_common::time::seconds_ago(self.single_task_grace.as_secs());
        let mut cleared = 0;

        for task in tasks::junk_candidates(&self.db).await? {
            let recent_single = task.kind == TaskKind::Single
                && task.completed_at.is_some_and(|at| at > grace_cutoff);
            if recent_single {
                continue;
            }

            let dir = task.working_dir(&self.download_root);
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => cleared += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(task_id = task.id, dir = %dir.display(), error = %e, "Failed to remove working directory");
                    continue;
                }
            }
            tasks::mark_junk_cleared(&self.db, task.id).await?;
        }

        Ok(cleared)
    }

    async fn resume_long_term_tasks(&self) -> ydl_common::Result<u64> {
        let stalled = tasks::tasks_with_status(&self.db, TaskStatus::RunningLongTerm).await?;
        let count = stalled.len() as u64;

        for task in stalled {
            info!(task_id = task.id, "Resuming long term task");
            let orchestrator = Arc::clone(&self.orchestrator);
            self.executor
                .submit(Box::pin(async move {
                    orchestrator.resume_batch(&task).await;
                }))
                .await;
        }

        Ok(count)
    }
}
