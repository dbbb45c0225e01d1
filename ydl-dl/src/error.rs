//! HTTP error mapping for ydl-dl

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::downloads::DownloadsError;
use crate::services::fetcher::FetchError;
use crate::services::resolver::ResolveError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), the owner already has a task in flight
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Remote platform failed (502)
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// ydl-common error
    #[error("Common error: {0}")]
    Common(#[from] ydl_common::Error),
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::BadResource(msg) => ApiError::BadRequest(msg),
            ResolveError::IndexOutOfRange(msg) => ApiError::BadRequest(msg),
            ResolveError::ConnectionFailure(msg) => ApiError::BadGateway(msg),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Resolve(inner) => inner.into(),
            FetchError::DurationNotAllowed(msg) => ApiError::BadRequest(msg),
            FetchError::DownloadFailure(msg) => ApiError::BadGateway(msg),
            FetchError::Io(err) => ApiError::Io(err),
        }
    }
}

impl From<DownloadsError> for ApiError {
    fn from(err: DownloadsError) -> Self {
        match err {
            DownloadsError::AlreadyRunning(msg) => ApiError::Conflict(msg),
            DownloadsError::NoTask => ApiError::NotFound("No task for this owner".to_string()),
            DownloadsError::NotReady => {
                ApiError::NotFound("No archive is waiting for pickup".to_string())
            }
            DownloadsError::InvalidInput(msg) => ApiError::BadRequest(msg),
            DownloadsError::Fetch(inner) => inner.into(),
            DownloadsError::Resolve(inner) => inner.into(),
            DownloadsError::Common(inner) => ApiError::Common(inner),
            DownloadsError::Io(inner) => ApiError::Io(inner),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "BAD_GATEWAY", msg),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg,
            ),
            ApiError::Io(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "IO_ERROR",
                err.to_string(),
            ),
            ApiError::Common(ref err @ ydl_common::Error::Locked { .. }) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "LEDGER_BUSY",
                err.to_string(),
            ),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
