//! 健康检查和服务状态 API
//!
//! 包含 /health, /status, /service/logs 端点

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::domain::DeployAttempt;
use crate::services::CoordinatorStatus;
use crate::state::AppState;

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    deploying: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_revision: Option<String>,
}

/// 服务状态响应
#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    coordinator: CoordinatorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_known_revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_success: Option<DeployAttempt>,
}

#[derive(Debug, Deserialize)]
struct LogTailQuery {
    #[serde(default = "default_tail")]
    tail: usize,
}

fn default_tail() -> usize {
    200
}

#[derive(Debug, Serialize)]
struct LogTailResponse {
    lines: Vec<String>,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/service/logs", get(service_logs))
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok",
        service: "eeveon",
        version: VERSION,
        timestamp: now.to_rfc3339(),
        uptime_secs: (now - state.started_at).num_seconds(),
        deploying: state.coordinator.is_deploying(),
        current_revision: state
            .coordinator
            .current_revision()
            .await
            .map(|r| r.id().to_string()),
    })
}

/// GET /status
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        coordinator: state.coordinator.status().await,
        last_known_revision: state.poller.last_known().await.map(|r| r.id().to_string()),
        last_success: state.attempts.last_success().await,
    })
}

/// GET /service/logs
async fn service_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogTailQuery>,
) -> Json<LogTailResponse> {
    let lines = match &state.supervisor {
        Some(supervisor) => supervisor.tail_logs(query.tail).await,
        None => Vec::new(),
    };
    Json(LogTailResponse { lines })
}
