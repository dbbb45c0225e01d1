//! Per-item and per-archive ledger operations

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use ydl_common::{Error, Result};

use crate::models::file_info::{part_archive_name, ARCHIVE_MARKER_INDEX};
use crate::models::{FileInfo, FileStatus, FINAL_ARCHIVE_NAME};
use crate::utils::{retry_on_lock, LEDGER_LOCK_WAIT};

fn file_from_row(row: &SqliteRow) -> Result<FileInfo> {
    let code: i64 = row.get("status_code");
    Ok(FileInfo {
        id: row.get("id"),
        task_id: row.get("task_id"),
        index: row.get("item_index"),
        file_id: row.get("file_id"),
        status: FileStatus::from_code(code)
            .ok_or_else(|| Error::CorruptRecord(format!("Unknown file status code: {}", code)))?,
        file_hash: row.get("file_hash"),
    })
}

/// Create every record a batch needs, all NOT_PROCESSED
///
/// Items get indexes 1..N in submission order; each expected part archive
/// and the final archive get an index-0 marker named after its file.
pub async fn create_batch_records(
    pool: &SqlitePool,
    task_id: i64,
    item_ids: &[String],
    part_count: usize,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    for (offset, file_id) in item_ids.iter().enumerate() {
        sqlx::query("INSERT INTO file_info (task_id, item_index, file_id, status_code) VALUES (?, ?, ?, 0)")
            .bind(task_id)
            .bind(offset as i64 + 1)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
    }

    let markers = (1..=part_count)
        .map(part_archive_name)
        .chain(std::iter::once(FINAL_ARCHIVE_NAME.to_string()));
    for name in markers {
        sqlx::query("INSERT INTO file_info (task_id, item_index, file_id, status_code) VALUES (?, ?, ?, 0)")
            .bind(task_id)
            .bind(ARCHIVE_MARKER_INDEX)
            .bind(&name)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;

    tracing::debug!(task_id, items = item_ids.len(), part_count, "Batch records created");
    Ok(())
}

/// Items of a task ordered by index (markers excluded)
pub async fn items_for_task(pool: &SqlitePool, task_id: i64) -> Result<Vec<FileInfo>> {
    let rows = sqlx::query(
        "SELECT id, task_id, item_index, file_id, status_code, file_hash FROM file_info \
         WHERE task_id = ? AND item_index > 0 ORDER BY item_index",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(file_from_row).collect()
}

/// Archive marker record by file name
pub async fn archive_record(pool: &SqlitePool, task_id: i64, name: &str) -> Result<Option<FileInfo>> {
    let row = sqlx::query(
        "SELECT id, task_id, item_index, file_id, status_code, file_hash FROM file_info \
         WHERE task_id = ? AND item_index = ? AND file_id = ?",
    )
    .bind(task_id)
    .bind(ARCHIVE_MARKER_INDEX)
    .bind(name)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(file_from_row).transpose()
}

pub async fn set_item_status(pool: &SqlitePool, task_id: i64, index: i64, status: FileStatus) -> Result<()> {
    retry_on_lock("set_item_status", LEDGER_LOCK_WAIT, || async {
        sqlx::query("UPDATE file_info SET status_code = ? WHERE task_id = ? AND item_index = ?")
            .bind(status.code())
            .bind(task_id)
            .bind(index)
            .execute(pool)
            .await?;
        Ok(())
    })
    .await
}

/// Store an archive's content hash and mark it PROCESSED
pub async fn set_archive_hash(pool: &SqlitePool, task_id: i64, name: &str, hash: &str) -> Result<()> {
    retry_on_lock("set_archive_hash", LEDGER_LOCK_WAIT, || async {
        sqlx::query(
            "UPDATE file_info SET file_hash = ?, status_code = ? \
             WHERE task_id = ? AND item_index = ? AND file_id = ?",
        )
        .bind(hash)
        .bind(FileStatus::Processed.code())
        .bind(task_id)
        .bind(ARCHIVE_MARKER_INDEX)
        .bind(name)
        .execute(pool)
        .await?;
        Ok(())
    })
    .await
}

/// Status codes of every item, in index order
pub async fn item_status_codes(pool: &SqlitePool, task_id: i64) -> Result<Vec<i64>> {
    let codes = sqlx::query_scalar(
        "SELECT status_code FROM file_info WHERE task_id = ? AND item_index > 0 ORDER BY item_index",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(codes)
}

/// Remote ids of items that ended in PROCESSING_ERROR
pub async fn failed_items(pool: &SqlitePool, task_id: i64) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT file_id FROM file_info WHERE task_id = ? AND item_index > 0 AND status_code = ? \
         ORDER BY item_index",
    )
    .bind(task_id)
    .bind(FileStatus::ProcessingError.code())
    .fetch_all(pool)
    .await?;
    Ok(ids)
}
