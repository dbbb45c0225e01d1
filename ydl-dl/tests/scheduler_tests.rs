//! Maintenance jobs run by the scheduler

mod helpers;

use helpers::{video_ids, Harness};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use ydl_dl::db::{files, tasks};
use ydl_dl::models::{AudioQuality, Owner, TaskKind, TaskStatus};
use ydl_dl::services::downloads::BatchOptions;
use ydl_dl::services::scheduler::{JobKind, Schedule, Scheduler, STOPPED_BY_RESTART};
use ydl_dl::services::BatchRequest;

fn scheduler(harness: &Harness, live_time: Duration, grace: Duration) -> Scheduler {
    Scheduler::new(
        harness.db.clone(),
        harness.orchestrator.clone(),
        harness.executor.clone(),
        live_time,
        grace,
        Schedule::standard(Duration::from_secs(60)),
    )
}

fn options() -> BatchOptions {
    BatchOptions {
        quality: AudioQuality::Kbps192,
        repair_tags: false,
        part_size: 2,
        send_mails: false,
    }
}

#[tokio::test]
async fn test_stop_broken_tasks_only_touches_running() {
    let harness = Harness::new().await;
    let single = tasks::create_task(&harness.db, &Owner::User(1), TaskKind::Single)
        .await
        .unwrap()
        .unwrap();
    let batch = tasks::create_task(&harness.db, &Owner::User(2), TaskKind::Batch)
        .await
        .unwrap()
        .unwrap();
    tasks::set_status(&harness.db, batch.id, TaskStatus::RunningLongTerm)
        .await
        .unwrap();

    let stopped = scheduler(&harness, Duration::from_secs(3600), Duration::from_secs(300))
        .run_job(JobKind::StopBrokenTasks)
        .await
        .unwrap();
    assert_eq!(stopped, 1);

    let single = tasks::load_task(&harness.db, single.id).await.unwrap().unwrap();
    assert_eq!(single.status, TaskStatus::Error);
    assert_eq!(single.progress, STOPPED_BY_RESTART);
    let batch = tasks::load_task(&harness.db, batch.id).await.unwrap().unwrap();
    assert_eq!(batch.status, TaskStatus::RunningLongTerm);
}

#[tokio::test]
async fn test_stop_broken_tasks_spares_tasks_of_this_process() {
    let harness = Harness::new().await;
    let stale = tasks::create_task(&harness.db, &Owner::User(1), TaskKind::Single)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let scheduler = scheduler(&harness, Duration::from_secs(3600), Duration::from_secs(300));
    tokio::time::sleep(Duration::from_millis(5)).await;
    // Request served while the start hooks are still pending
    let live = tasks::create_task(&harness.db, &Owner::User(2), TaskKind::Single)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(scheduler.run_job(JobKind::StopBrokenTasks).await.unwrap(), 1);

    let stale = tasks::load_task(&harness.db, stale.id).await.unwrap().unwrap();
    assert_eq!(stale.status, TaskStatus::Error);
    let live = tasks::load_task(&harness.db, live.id).await.unwrap().unwrap();
    assert_eq!(live.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_clear_junk_respects_single_task_grace() {
    let harness = Harness::new().await;
    let owner = Owner::Ip("198.51.100.4".to_string());
    let single = harness
        .downloads
        .start_single_download("https://youtu.be/vid00000001", &owner, AudioQuality::Kbps64, false)
        .await
        .unwrap();
    assert!(single.path.exists());
    let dir = single.task.working_dir(&harness.download_root());

    let patient = scheduler(&harness, Duration::from_secs(3600), Duration::from_secs(300));
    assert_eq!(patient.run_job(JobKind::ClearJunk).await.unwrap(), 0);
    assert!(dir.exists());

    let eager = scheduler(&harness, Duration::from_secs(3600), Duration::ZERO);
    assert_eq!(eager.run_job(JobKind::ClearJunk).await.unwrap(), 1);
    assert!(!dir.exists());

    let task = tasks::load_task(&harness.db, single.task.id).await.unwrap().unwrap();
    assert!(task.junk_cleared);

    // Already cleared tasks are not visited again
    assert_eq!(eager.run_job(JobKind::ClearJunk).await.unwrap(), 0);
}

#[tokio::test]
async fn test_clear_junk_removes_picked_up_batches() {
    let harness = Harness::new().await;
    let owner = Owner::User(3);
    let task = harness
        .downloads
        .start_batch_download(video_ids(2), &owner, options())
        .await
        .unwrap();
    let dir = task.working_dir(&harness.download_root());

    // Ready archives are left alone until picked up
    let jobs = scheduler(&harness, Duration::from_secs(3600), Duration::from_secs(300));
    assert_eq!(jobs.run_job(JobKind::ClearJunk).await.unwrap(), 0);
    assert!(dir.exists());

    harness.downloads.fetch_ready_archive(&owner).await.unwrap();
    assert_eq!(jobs.run_job(JobKind::ClearJunk).await.unwrap(), 1);
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_expired_ready_tasks_are_closed() {
    let harness = Harness::new().await;
    let owner = Owner::User(4);
    let task = harness
        .downloads
        .start_batch_download(video_ids(1), &owner, options())
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::WaitingOnUser);

    let long_lived = scheduler(&harness, Duration::from_secs(3600), Duration::from_secs(300));
    assert_eq!(long_lived.run_job(JobKind::CloseExpiredReadyTasks).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let short_lived = scheduler(&harness, Duration::ZERO, Duration::from_secs(300));
    assert_eq!(short_lived.run_job(JobKind::CloseExpiredReadyTasks).await.unwrap(), 1);

    let task = tasks::load_task(&harness.db, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(harness.downloads.fetch_ready_archive(&owner).await.is_err());
}

#[tokio::test]
async fn test_on_start_resumes_long_term_batches() {
    let harness = Harness::new().await;
    let owner = Owner::User(5);
    let task = tasks::create_task(&harness.db, &owner, TaskKind::Batch)
        .await
        .unwrap()
        .unwrap();
    let dir = task.working_dir(&harness.download_root());
    harness
        .orchestrator
        .prepare(
            &task,
            &dir,
            &BatchRequest {
                item_ids: video_ids(3),
                quality: AudioQuality::Kbps192,
                repair_tags: false,
                part_size: 2,
                send_mails: false,
            },
        )
        .await
        .unwrap();

    scheduler(&harness, Duration::from_secs(3600), Duration::from_secs(300))
        .run_on_start()
        .await;

    let task = tasks::load_task(&harness.db, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::WaitingOnUser);
    assert_eq!(harness.downloader.total_calls(), 3);
    assert!(files::failed_items(&harness.db, task.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timers_stop_on_cancel() {
    let harness = Harness::new().await;
    let scheduler = Arc::new(scheduler(&harness, Duration::from_secs(3600), Duration::from_secs(300)));

    let cancel = CancellationToken::new();
    let timers = scheduler.spawn_timers(cancel.clone());
    assert_eq!(timers.len(), 1);

    cancel.cancel();
    for timer in timers {
        tokio::time::timeout(Duration::from_secs(1), timer)
            .await
            .unwrap()
            .unwrap();
    }
}
