//! Download endpoints
//!
//! - `POST /download`: convert one item and stream the MP3 back
//! - `POST /batch`: submit a batch (authenticated users only)
//! - `GET /progress`: status of the owner's latest task
//! - `GET /batch/progress`: the same plus per-item status codes
//! - `GET /batch/archive`: stream the ready archive and close the task

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use super::RequestOwner;
use crate::error::{ApiError, ApiResult};
use crate::models::{AudioQuality, Owner};
use crate::services::downloads::{BatchOptions, BatchProgressView, TaskStatusView};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SingleDownloadRequest {
    pub url: String,
    pub quality: Option<u32>,
    #[serde(default)]
    pub repair_tags: bool,
}

/// Either explicit item ids or a playlist link with a `[start, end)` range
#[derive(Debug, Deserialize)]
pub struct BatchDownloadRequest {
    pub items: Option<Vec<String>>,
    pub playlist_url: Option<String>,
    #[serde(default)]
    pub start: i64,
    pub end: Option<i64>,
    pub quality: Option<u32>,
    #[serde(default)]
    pub repair_tags: bool,
    pub part_size: Option<usize>,
}

fn quality_or_default(requested: Option<u32>, default: AudioQuality) -> ApiResult<AudioQuality> {
    match requested {
        Some(kbps) => AudioQuality::try_from(kbps).map_err(|e| ApiError::BadRequest(e.to_string())),
        None => Ok(default),
    }
}

/// ASCII-only attachment header; other characters become `_`
fn attachment(file_name: &str) -> HeaderValue {
    let safe: String = file_name
        .chars()
        .map(|c| {
            let plain = (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ';
            if plain {
                c
            } else {
                '_'
            }
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", safe))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn file_response(file: tokio::fs::File, file_name: &str, content_type: &'static str) -> ApiResult<Response> {
    let size = file.metadata().await?.len();
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_DISPOSITION, attachment(file_name));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    Ok(response)
}

/// POST /download
pub async fn single_download(
    State(state): State<AppState>,
    RequestOwner(owner): RequestOwner,
    Json(request): Json<SingleDownloadRequest>,
) -> ApiResult<Response> {
    let quality = quality_or_default(request.quality, state.config.default_quality)?;

    let result = state
        .downloads
        .start_single_download(&request.url, &owner, quality, request.repair_tags)
        .await;
    let download = match result {
        Ok(download) => download,
        Err(e) => {
            let err = ApiError::from(e);
            state.record_error(&err).await;
            return Err(err);
        }
    };

    let file = tokio::fs::File::open(&download.path).await?;
    let file_name = download
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download.mp3".to_string());
    file_response(file, &file_name, "audio/mpeg").await
}

/// POST /batch
pub async fn batch_download(
    State(state): State<AppState>,
    RequestOwner(owner): RequestOwner,
    Json(request): Json<BatchDownloadRequest>,
) -> ApiResult<(StatusCode, Json<TaskStatusView>)> {
    if !matches!(owner, Owner::User(_)) {
        return Err(ApiError::BadRequest(
            "Batch downloads require an authenticated user".to_string(),
        ));
    }

    let options = BatchOptions {
        quality: quality_or_default(request.quality, state.config.default_quality)?,
        repair_tags: request.repair_tags,
        part_size: request.part_size.unwrap_or(state.config.playlist_part_size),
        send_mails: state.config.send_mails,
    };

    let submitted = match (request.items, request.playlist_url) {
        (Some(items), None) => state.downloads.start_batch_download(items, &owner, options).await,
        (None, Some(url)) => {
            let end = request.end.unwrap_or(i64::MAX);
            state
                .downloads
                .start_playlist_download(&url, request.start, end, &owner, options)
                .await
        }
        _ => {
            return Err(ApiError::BadRequest(
                "Give either items or playlist_url".to_string(),
            ))
        }
    };

    let task = match submitted {
        Ok(task) => task,
        Err(e) => {
            let err = ApiError::from(e);
            state.record_error(&err).await;
            return Err(err);
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskStatusView {
            task_id: task.id,
            status_code: task.status.code(),
            progress: task.progress,
        }),
    ))
}

/// GET /progress
pub async fn task_progress(
    State(state): State<AppState>,
    RequestOwner(owner): RequestOwner,
) -> ApiResult<Json<TaskStatusView>> {
    Ok(Json(state.downloads.get_task_status(&owner).await?))
}

/// GET /batch/progress
pub async fn batch_progress(
    State(state): State<AppState>,
    RequestOwner(owner): RequestOwner,
) -> ApiResult<Json<BatchProgressView>> {
    Ok(Json(state.downloads.get_batch_progress(&owner).await?))
}

/// GET /batch/archive
pub async fn batch_archive(
    State(state): State<AppState>,
    RequestOwner(owner): RequestOwner,
) -> ApiResult<Response> {
    let archive = state.downloads.fetch_ready_archive(&owner).await?;
    file_response(archive.file, &archive.file_name, "application/zip").await
}

pub fn download_routes() -> Router<AppState> {
    Router::new()
        .route("/download", post(single_download))
        .route("/batch", post(batch_download))
        .route("/progress", get(task_progress))
        .route("/batch/progress", get(batch_progress))
        .route("/batch/archive", get(batch_archive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_header_is_ascii() {
        let value = attachment("Sigur Rós - \"Hoppípolla\".mp3");
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"Sigur R_s - _Hopp_polla_.mp3\""
        );
    }

    #[test]
    fn test_quality_defaults_and_validation() {
        assert_eq!(
            quality_or_default(None, AudioQuality::Kbps192).unwrap(),
            AudioQuality::Kbps192
        );
        assert_eq!(
            quality_or_default(Some(320), AudioQuality::Kbps192).unwrap(),
            AudioQuality::Kbps320
        );
        assert!(matches!(
            quality_or_default(Some(100), AudioQuality::Kbps192),
            Err(ApiError::BadRequest(_))
        ));
    }
}
