//! 部署管理 API
//!
//! 包含 /check, /deploy, /attempts/*, /logs/* 端点

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::domain::{DeployAttempt, DeployOutcome, DeployTrigger, Revision};
use crate::error::{ApiError, ApiResult, DeployError};
use crate::middleware::RequireApiKey;
use crate::services::DeployTicket;
use crate::state::AppState;

/// 检查更新请求
#[derive(Debug, Default, Deserialize)]
pub struct CheckRequest {
    /// 发现新版本时立即部署
    #[serde(default)]
    pub deploy: bool,
}

/// 检查更新响应
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub update_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployAccepted>,
}

/// 触发部署请求
#[derive(Debug, Default, Deserialize)]
pub struct DeployRequest {
    /// 目标版本；缺省时使用上游最新版本
    pub revision: Option<String>,
}

/// 部署已受理
#[derive(Debug, Serialize)]
pub struct DeployAccepted {
    pub attempt_id: String,
    pub revision: String,
    pub status: &'static str,
    pub stream_url: String,
}

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct AttemptHistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// 结果过滤 (success, failed, rolled_back, fatal_failure)
    pub outcome: Option<DeployOutcome>,
}

fn default_limit() -> usize {
    20
}

/// 历史响应
#[derive(Debug, Serialize)]
pub struct AttemptHistoryResponse {
    pub attempts: Vec<DeployAttempt>,
    pub total: usize,
}

/// 创建部署路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/check", post(check_update))
        .route("/deploy", post(trigger_deploy))
        .route("/attempts", get(list_attempts))
        .route("/attempts/:id", get(get_attempt))
        .route("/logs/:id/stream", get(stream_logs))
}

/// 在后台执行已受理的部署
fn spawn_deploy(state: &Arc<AppState>, ticket: DeployTicket) -> DeployAccepted {
    let accepted = DeployAccepted {
        attempt_id: ticket.attempt_id().to_string(),
        revision: ticket.revision().id().to_string(),
        status: "accepted",
        stream_url: format!("/logs/{}/stream", ticket.attempt_id()),
    };

    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        coordinator.execute(ticket).await;
    });

    accepted
}

/// POST /check
async fn check_update(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    body: Option<Json<CheckRequest>>,
) -> ApiResult<Json<CheckResponse>> {
    let request = body.map(|Json(b)| b).unwrap_or_default();

    // 只检查时不记住结果，轮询循环仍会部署这个版本
    let found = if request.deploy {
        state.poller.check_for_update().await?
    } else {
        state.poller.peek_update().await?
    };
    let Some(revision) = found else {
        return Ok(Json(CheckResponse {
            update_available: false,
            revision: None,
            deploy: None,
        }));
    };

    let deploy = if request.deploy {
        match state
            .coordinator
            .begin(revision.clone(), DeployTrigger::Api)
            .await
        {
            Ok(ticket) => Some(spawn_deploy(&state, ticket)),
            Err(e @ DeployError::AlreadyDeploying { .. }) => {
                state.poller.defer(&revision).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        None
    };

    Ok(Json(CheckResponse {
        update_available: true,
        revision: Some(revision.id().to_string()),
        deploy,
    }))
}

/// POST /deploy
async fn trigger_deploy(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    body: Option<Json<DeployRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = body.map(|Json(b)| b).unwrap_or_default();

    let revision = match request.revision.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => {
            let revision = Revision::new(id);
            if !revision.is_path_safe() {
                return Err(ApiError::bad_request(format!("invalid revision '{}'", id)));
            }
            revision
        }
        _ => state.poller.latest_upstream().await?,
    };

    let ticket = state
        .coordinator
        .begin(revision, DeployTrigger::Api)
        .await?;
    let accepted = spawn_deploy(&state, ticket);

    info!(
        attempt_id = %accepted.attempt_id,
        revision = %accepted.revision,
        "Deploy triggered via API"
    );

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// GET /attempts
async fn list_attempts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AttemptHistoryQuery>,
) -> Json<AttemptHistoryResponse> {
    let limit = query.limit.clamp(1, 100);
    let attempts = state.attempts.list(limit, query.outcome).await;
    let total = state.attempts.count().await;

    Json(AttemptHistoryResponse { attempts, total })
}

/// GET /attempts/:id
async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> ApiResult<Json<DeployAttempt>> {
    if let Some(attempt) = state
        .coordinator
        .in_flight()
        .await
        .filter(|a| a.id == attempt_id)
    {
        return Ok(Json(attempt));
    }

    state
        .attempts
        .get(&attempt_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Attempt '{}'", attempt_id)))
}

/// GET /logs/:id/stream
///
/// 实时日志；尝试已结束时只返回 complete 事件
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let rx = state.log_hub.subscribe(&attempt_id).await;
    if rx.is_none() && state.attempts.get(&attempt_id).await.is_none() {
        return Err(ApiError::not_found(format!("Attempt '{}'", attempt_id)));
    }

    let state_clone = state.clone();
    let attempt_id_clone = attempt_id.clone();

    let stream = async_stream::stream! {
        if let Some(mut rx) = rx {
            loop {
                match rx.recv().await {
                    Ok(log_line) => {
                        let json = serde_json::to_string(&log_line).unwrap_or_default();
                        yield Ok(Event::default().data(json));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(attempt_id = %attempt_id_clone, lagged = n, "Log subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }

        // 发送结束事件
        if let Some(attempt) = state_clone.attempts.get(&attempt_id_clone).await {
            yield Ok(Event::default().event("complete").data(
                serde_json::json!({
                    "outcome": attempt.outcome,
                    "revision": attempt.revision.id(),
                    "duration_ms": attempt.duration_ms,
                    "error": attempt.error,
                }).to_string()
            ));
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}
