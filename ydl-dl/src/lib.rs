//! ydl-dl library interface
//!
//! Exposes the download engine and HTTP surface for the binary and for
//! integration testing.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::error;
use ydl_common::events::EventBus;

use crate::config::DownloaderConfig;
use crate::services::Downloads;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub downloads: Arc<Downloads>,
    pub config: Arc<DownloaderConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last server-side error, reported by `/health`
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        downloads: Arc<Downloads>,
        config: DownloaderConfig,
    ) -> Self {
        Self {
            db,
            event_bus,
            downloads,
            config: Arc::new(config),
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember a server-side failure; client mistakes are not recorded
    pub async fn record_error(&self, err: &ApiError) {
        if matches!(err, ApiError::BadRequest(_) | ApiError::NotFound(_) | ApiError::Conflict(_)) {
            return;
        }
        error!(error = %err, "Request failed");
        *self.last_error.write().await = Some(err.to_string());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::download_routes())
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
