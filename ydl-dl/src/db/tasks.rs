//! Task ledger operations
//!
//! Every write that can contend with another worker goes through
//! [`retry_on_lock`].

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use ydl_common::{Error, Result};

use super::{format_timestamp, parse_timestamp};
use crate::models::task::progress;
use crate::models::{Owner, Task, TaskKind, TaskStatus};
use crate::utils::{retry_on_lock, LEDGER_LOCK_WAIT};

const TASK_COLUMNS: &str = "id, description, user_ip, user_id, status_code, progress, \
     unique_process_info, created_at, completed_at, junk_cleared";

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let description: String = row.get("description");
    let kind = TaskKind::parse(&description)
        .ok_or_else(|| Error::CorruptRecord(format!("Unknown task description: {}", description)))?;

    let user_ip: Option<String> = row.get("user_ip");
    let user_id: Option<i64> = row.get("user_id");
    let owner = match (user_ip, user_id) {
        (Some(ip), None) => Owner::Ip(ip),
        (None, Some(id)) => Owner::User(id),
        _ => return Err(Error::CorruptRecord("Task row has no single owner".to_string())),
    };

    let code: i64 = row.get("status_code");
    let status = TaskStatus::from_code(code)
        .ok_or_else(|| Error::CorruptRecord(format!("Unknown task status code: {}", code)))?;

    let created_at: String = row.get("created_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(Task {
        id: row.get("id"),
        kind,
        owner,
        status,
        progress: row.get("progress"),
        unique_process_info: row.get("unique_process_info"),
        created_at: parse_timestamp(&created_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        junk_cleared: row.get::<i64, _>("junk_cleared") != 0,
    })
}

/// Create a RUNNING task unless the owner already has one
///
/// The existence check and the insert are one statement, and the partial
/// unique indexes reject whatever slips past it, so concurrent callers for
/// the same owner get exactly one task. Returns `None` for the losers.
pub async fn create_task(pool: &SqlitePool, owner: &Owner, kind: TaskKind) -> Result<Option<Task>> {
    let user_ip = owner.user_ip().map(str::to_string);
    let user_id = owner.user_id();
    let created_at = format_timestamp(Utc::now());

    let inserted = retry_on_lock("create_task", LEDGER_LOCK_WAIT, || async {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (description, user_ip, user_id, status_code, progress, created_at)
            SELECT ?, ?, ?, 0, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM tasks
                WHERE status_code = 0
                  AND ((? IS NOT NULL AND user_ip = ?) OR (? IS NOT NULL AND user_id = ?))
            )
            "#,
        )
        .bind(kind.as_str())
        .bind(&user_ip)
        .bind(user_id)
        .bind(progress::WAITING)
        .bind(&created_at)
        .bind(&user_ip)
        .bind(&user_ip)
        .bind(user_id)
        .bind(user_id)
        .execute(pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(Some(done.last_insert_rowid())),
            Ok(_) => Ok(None),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(None),
            Err(e) => Err(Error::Database(e)),
        }
    })
    .await?;

    match inserted {
        Some(id) => {
            tracing::info!(task_id = id, owner = %owner, kind = kind.as_str(), "Task created");
            load_task(pool, id).await
        }
        None => Ok(None),
    }
}

pub async fn load_task(pool: &SqlitePool, task_id: i64) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
    let row = sqlx::query(&sql).bind(task_id).fetch_optional(pool).await?;
    row.as_ref().map(task_from_row).transpose()
}

/// Most recent task of `owner` whose status is one of `statuses`
async fn latest_for_owner(
    pool: &SqlitePool,
    owner: &Owner,
    statuses: &[TaskStatus],
) -> Result<Option<Task>> {
    let codes = statuses
        .iter()
        .map(|s| s.code().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {} FROM tasks \
         WHERE ((? IS NOT NULL AND user_ip = ?) OR (? IS NOT NULL AND user_id = ?)) \
           AND status_code IN ({}) \
         ORDER BY id DESC LIMIT 1",
        TASK_COLUMNS, codes
    );

    let row = sqlx::query(&sql)
        .bind(owner.user_ip())
        .bind(owner.user_ip())
        .bind(owner.user_id())
        .bind(owner.user_id())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(task_from_row).transpose()
}

/// Task of `owner` still doing work (RUNNING or RUNNING_LONG_TERM)
pub async fn find_active_task(pool: &SqlitePool, owner: &Owner) -> Result<Option<Task>> {
    latest_for_owner(pool, owner, &[TaskStatus::Running, TaskStatus::RunningLongTerm]).await
}

/// Task of `owner` whose archive awaits pickup
pub async fn find_ready_task(pool: &SqlitePool, owner: &Owner) -> Result<Option<Task>> {
    latest_for_owner(pool, owner, &[TaskStatus::WaitingOnUser]).await
}

/// Most recent task of `owner` in any state
pub async fn find_latest_task(pool: &SqlitePool, owner: &Owner) -> Result<Option<Task>> {
    latest_for_owner(
        pool,
        owner,
        &[
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::RunningLongTerm,
            TaskStatus::WaitingOnUser,
        ],
    )
    .await
}

pub async fn tasks_with_status(pool: &SqlitePool, status: TaskStatus) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE status_code = ? ORDER BY id",
        TASK_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(status.code()).fetch_all(pool).await?;
    rows.iter().map(task_from_row).collect()
}

pub async fn count_with_status(pool: &SqlitePool, status: TaskStatus) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status_code = ?")
        .bind(status.code())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn update_progress(pool: &SqlitePool, task_id: i64, text: &str) -> Result<()> {
    retry_on_lock("update_progress", LEDGER_LOCK_WAIT, || async {
        sqlx::query("UPDATE tasks SET progress = ? WHERE id = ?")
            .bind(text)
            .bind(task_id)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

pub async fn set_status(pool: &SqlitePool, task_id: i64, status: TaskStatus) -> Result<()> {
    retry_on_lock("set_status", LEDGER_LOCK_WAIT, || async {
        sqlx::query("UPDATE tasks SET status_code = ? WHERE id = ?")
            .bind(status.code())
            .bind(task_id)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

/// Final artifact is ready for pickup (WAITING_ON_USER)
pub async fn mark_ready(
    pool: &SqlitePool,
    task_id: i64,
    artifact_path: &str,
    progress_text: &str,
) -> Result<()> {
    finish(
        pool,
        "mark_ready",
        task_id,
        TaskStatus::WaitingOnUser,
        progress_text,
        Some(artifact_path),
    )
    .await
}

pub async fn mark_completed(pool: &SqlitePool, task_id: i64, progress_text: &str) -> Result<()> {
    finish(pool, "mark_completed", task_id, TaskStatus::Completed, progress_text, None).await
}

/// Unrecoverable failure: status ERROR, reason kept as progress
pub async fn mark_failed(pool: &SqlitePool, task_id: i64, reason: &str) -> Result<()> {
    tracing::warn!(task_id, reason, "Task failed");
    finish(pool, "mark_failed", task_id, TaskStatus::Error, reason, None).await
}

async fn finish(
    pool: &SqlitePool,
    op: &str,
    task_id: i64,
    status: TaskStatus,
    progress_text: &str,
    artifact_path: Option<&str>,
) -> Result<()> {
    let completed_at = format_timestamp(Utc::now());
    retry_on_lock(op, LEDGER_LOCK_WAIT, || async {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status_code = ?, progress = ?, completed_at = ?,
                unique_process_info = COALESCE(?, unique_process_info)
            WHERE id = ?
            "#,
        )
        .bind(status.code())
        .bind(progress_text)
        .bind(&completed_at)
        .bind(artifact_path)
        .bind(task_id)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

/// Stop RUNNING tasks created before `created_before` by a previous process
///
/// RUNNING_LONG_TERM tasks are untouched; they resume from their checkpoint.
pub async fn stop_running_tasks(
    pool: &SqlitePool,
    reason: &str,
    created_before: DateTime<Utc>,
) -> Result<u64> {
    let completed_at = format_timestamp(Utc::now());
    let cutoff = format_timestamp(created_before);
    retry_on_lock("stop_running_tasks", LEDGER_LOCK_WAIT, || async {
        let done = sqlx::query(
            "UPDATE tasks SET status_code = ?, progress = ?, completed_at = ? \
             WHERE status_code = ? AND created_at < ?",
        )
        .bind(TaskStatus::Error.code())
        .bind(reason)
        .bind(&completed_at)
        .bind(TaskStatus::Running.code())
        .bind(&cutoff)
        .execute(pool)
        .await?;
        Ok(done.rows_affected())
    })
    .await
}

/// Close ready tasks whose archive waited since before `cutoff`
pub async fn close_expired_ready(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let cutoff = format_timestamp(cutoff);
    retry_on_lock("close_expired_ready", LEDGER_LOCK_WAIT, || async {
        let done = sqlx::query(
            "UPDATE tasks SET status_code = ?, progress = ? \
             WHERE status_code = ? AND completed_at IS NOT NULL AND completed_at < ?",
        )
        .bind(TaskStatus::Completed.code())
        .bind(progress::DONE)
        .bind(TaskStatus::WaitingOnUser.code())
        .bind(&cutoff)
        .execute(pool)
        .await?;
        Ok(done.rows_affected())
    })
    .await
}

/// Finished tasks whose working files have not been reclaimed yet
pub async fn junk_candidates(pool: &SqlitePool) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks WHERE status_code IN (?, ?) AND junk_cleared = 0 ORDER BY id",
        TASK_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(TaskStatus::Completed.code())
        .bind(TaskStatus::Error.code())
        .fetch_all(pool)
        .await?;
    rows.iter().map(task_from_row).collect()
}

pub async fn mark_junk_cleared(pool: &SqlitePool, task_id: i64) -> Result<()> {
    retry_on_lock("mark_junk_cleared", LEDGER_LOCK_WAIT, || async {
        sqlx::query("UPDATE tasks SET junk_cleared = 1 WHERE id = ?")
            .bind(task_id)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;

    #[tokio::test]
    async fn test_create_task_starts_running_and_waiting() {
        let pool = init_memory_pool().await.unwrap();
        let owner = Owner::Ip("10.0.0.1".to_string());

        let task = create_task(&pool, &owner, TaskKind::Single).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.progress, progress::WAITING);
        assert_eq!(task.owner, owner);
        assert!(task.completed_at.is_none());
        assert!(!task.junk_cleared);
    }

    #[tokio::test]
    async fn test_second_running_task_for_same_owner_is_refused() {
        let pool = init_memory_pool().await.unwrap();
        let owner = Owner::User(9);

        assert!(create_task(&pool, &owner, TaskKind::Batch).await.unwrap().is_some());
        assert!(create_task(&pool, &owner, TaskKind::Single).await.unwrap().is_none());

        // Other owners are independent
        assert!(create_task(&pool, &Owner::User(10), TaskKind::Single)
            .await
            .unwrap()
            .is_some());
        assert!(create_task(&pool, &Owner::Ip("9".to_string()), TaskKind::Single)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_new_task_allowed_after_long_term_transition() {
        let pool = init_memory_pool().await.unwrap();
        let owner = Owner::User(1);

        let first = create_task(&pool, &owner, TaskKind::Batch).await.unwrap().unwrap();
        set_status(&pool, first.id, TaskStatus::RunningLongTerm).await.unwrap();

        let second = create_task(&pool, &owner, TaskKind::Single).await.unwrap();
        assert!(second.is_some());
    }

    #[tokio::test]
    async fn test_find_active_and_ready() {
        let pool = init_memory_pool().await.unwrap();
        let owner = Owner::User(5);

        let task = create_task(&pool, &owner, TaskKind::Batch).await.unwrap().unwrap();
        assert_eq!(find_active_task(&pool, &owner).await.unwrap().unwrap().id, task.id);
        assert!(find_ready_task(&pool, &owner).await.unwrap().is_none());

        mark_ready(&pool, task.id, "/data/Task1/playlist.zip", "Files downloaded(3) with 0 fails")
            .await
            .unwrap();

        assert!(find_active_task(&pool, &owner).await.unwrap().is_none());
        let ready = find_ready_task(&pool, &owner).await.unwrap().unwrap();
        assert_eq!(ready.status, TaskStatus::WaitingOnUser);
        assert_eq!(ready.unique_process_info.as_deref(), Some("/data/Task1/playlist.zip"));
        assert!(ready.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_failed_keeps_reason() {
        let pool = init_memory_pool().await.unwrap();
        let task = create_task(&pool, &Owner::User(2), TaskKind::Batch)
            .await
            .unwrap()
            .unwrap();

        mark_failed(&pool, task.id, "Archive write failed").await.unwrap();

        let task = load_task(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.progress, "Archive write failed");
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_running_spares_long_term() {
        let pool = init_memory_pool().await.unwrap();
        let stale = create_task(&pool, &Owner::User(1), TaskKind::Single)
            .await
            .unwrap()
            .unwrap();
        let batch = create_task(&pool, &Owner::User(2), TaskKind::Batch)
            .await
            .unwrap()
            .unwrap();
        set_status(&pool, batch.id, TaskStatus::RunningLongTerm).await.unwrap();

        let started = Utc::now();
        let fresh = create_task(&pool, &Owner::User(3), TaskKind::Single)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(stop_running_tasks(&pool, "Stopped", started).await.unwrap(), 1);
        assert_eq!(load_task(&pool, fresh.id).await.unwrap().unwrap().status, TaskStatus::Running);

        assert_eq!(load_task(&pool, stale.id).await.unwrap().unwrap().status, TaskStatus::Error);
        assert_eq!(
            load_task(&pool, batch.id).await.unwrap().unwrap().status,
            TaskStatus::RunningLongTerm
        );
    }

    #[tokio::test]
    async fn test_close_expired_ready() {
        let pool = init_memory_pool().await.unwrap();
        let task = create_task(&pool, &Owner::User(1), TaskKind::Batch)
            .await
            .unwrap()
            .unwrap();
        mark_ready(&pool, task.id, "/x/playlist.zip", "ready").await.unwrap();

        // Cutoff in the past: nothing expires yet
        let closed = close_expired_ready(&pool, Utc::now() - chrono::Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(closed, 0);

        let closed = close_expired_ready(&pool, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(closed, 1);
        let task = load_task(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, progress::DONE);
    }

    #[tokio::test]
    async fn test_junk_candidates_and_clearing() {
        let pool = init_memory_pool().await.unwrap();
        let done = create_task(&pool, &Owner::User(1), TaskKind::Single)
            .await
            .unwrap()
            .unwrap();
        let running = create_task(&pool, &Owner::User(2), TaskKind::Single)
            .await
            .unwrap()
            .unwrap();
        mark_completed(&pool, done.id, progress::DONE).await.unwrap();

        let candidates = junk_candidates(&pool).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, done.id);
        assert_ne!(candidates[0].id, running.id);

        mark_junk_cleared(&pool, done.id).await.unwrap();
        assert!(junk_candidates(&pool).await.unwrap().is_empty());
    }
}
