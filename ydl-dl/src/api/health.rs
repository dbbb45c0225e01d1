//! Health check endpoint
//!
//! Reports build identification, uptime and a snapshot of the ledger.
//! Status turns "degraded" once a server-side error has been recorded.

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::db::tasks;
use crate::models::TaskStatus;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub module: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub build_profile: &'static str,
    pub uptime_seconds: u64,
    pub execution: String,
    /// Tasks currently downloading (single and batch)
    pub running_tasks: i64,
    /// Archives waiting for pickup
    pub ready_archives: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = Utc::now()
        .signed_duration_since(state.startup_time)
        .num_seconds()
        .max(0) as u64;

    let mut running_tasks = 0;
    for status in [TaskStatus::Running, TaskStatus::RunningLongTerm] {
        running_tasks += count_or_zero(&state, status).await;
    }
    let ready_archives = count_or_zero(&state, TaskStatus::WaitingOnUser).await;
    let last_error = state.last_error.read().await.clone();

    Json(HealthResponse {
        status: if last_error.is_some() { "degraded" } else { "ok" },
        module: "ydl-dl",
        version: env!("CARGO_PKG_VERSION"),
        git_hash: env!("GIT_HASH"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        build_profile: env!("BUILD_PROFILE"),
        uptime_seconds,
        execution: format!("{:?}", state.config.execution).to_lowercase(),
        running_tasks,
        ready_archives,
        last_error,
    })
}

async fn count_or_zero(state: &AppState, status: TaskStatus) -> i64 {
    match tasks::count_with_status(&state.db, status).await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, ?status, "Health check could not count tasks");
            0
        }
    }
}

pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
