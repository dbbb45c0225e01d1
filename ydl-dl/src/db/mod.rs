//! Status ledger storage
//!
//! SQLite tables for tasks and their per-item/per-archive records.

pub mod files;
pub mod tasks;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use ydl_common::{Error, Result};

/// Initialize database connection pool and create tables
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    init_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory pool with tables created
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    init_tables(&pool).await?;
    Ok(pool)
}

/// Create ledger tables and indexes if they don't exist
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            description TEXT NOT NULL,
            user_ip TEXT,
            user_id INTEGER,
            status_code INTEGER NOT NULL,
            progress TEXT NOT NULL DEFAULT '',
            unique_process_info TEXT,
            created_at TEXT NOT NULL,
            completed_at TEXT,
            junk_cleared INTEGER NOT NULL DEFAULT 0,
            CHECK ((user_ip IS NULL) <> (user_id IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one RUNNING task per owner
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_running_ip \
         ON tasks(user_ip) WHERE status_code = 0 AND user_ip IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_running_user \
         ON tasks(user_id) WHERE status_code = 0 AND user_id IS NOT NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_info (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            item_index INTEGER NOT NULL,
            file_id TEXT NOT NULL,
            status_code INTEGER NOT NULL DEFAULT 0,
            file_hash TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_info_task ON file_info(task_id, item_index)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (tasks, file_info)");

    Ok(())
}

/// Fixed-width UTC timestamp so stored values compare lexically
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::CorruptRecord(format!("Failed to parse timestamp {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_database_pool_creates_file_and_tables() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("ydl.db");

        let pool = init_database_pool(&db_path).await.unwrap();
        assert!(db_path.exists());

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('tasks', 'file_info') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["file_info".to_string(), "tasks".to_string()]);

        // Idempotent
        init_tables(&pool).await.unwrap();
    }

    #[test]
    fn test_timestamps_are_fixed_width() {
        let a = format_timestamp(Utc::now());
        let b = format_timestamp(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(format_timestamp(parse_timestamp(&a).unwrap()), a);
    }
}
