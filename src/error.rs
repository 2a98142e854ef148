//! 统一错误处理
//!
//! - `DeployError`：部署流程的错误分类（可重试 / 拒绝 / 回滚 / 终态）
//! - `ApiError`：实现 `IntoResponse` 的 HTTP 错误

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::domain::deploy::IllegalTransition;

/// 部署流程错误
#[derive(Debug, Error)]
pub enum DeployError {
    /// 版本源不可达（网络/认证/命令失败），可重试
    #[error("revision source unreachable: {0}")]
    SourceUnreachable(String),

    /// 已有部署在进行，直接拒绝
    #[error("deploy {attempt_id} of {revision} already in progress")]
    AlreadyDeploying { attempt_id: String, revision: String },

    /// 版本无法获取（Preparing 阶段失败）
    #[error("revision {0} is not available: {1}")]
    RevisionUnavailable(String, String),

    /// 进程未在宽限期内退出
    #[error("service did not stop within {0:?}")]
    StopTimeout(Duration),

    #[error("install failed: {0}")]
    InstallFailure(String),

    #[error("service failed to start: {0}")]
    StartFailure(String),

    #[error("health check failed: {0}")]
    HealthCheckFailure(String),

    /// 新旧版本均不健康，需要人工介入
    #[error("fatal: {0}")]
    FatalFailure(String),

    #[error("deploy exceeded {0:?}")]
    Timeout(Duration),

    #[error("illegal phase transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::domain::DeployPhase,
        to: crate::domain::DeployPhase,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// 是否可以在本地退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeployError::SourceUnreachable(_))
    }
}

impl From<IllegalTransition> for DeployError {
    fn from(e: IllegalTransition) -> Self {
        DeployError::InvalidTransition {
            from: e.from,
            to: e.to,
        }
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突（部署已在进行）
    Conflict(String),
    /// 500 - 内部错误
    Internal(String),
    /// 503 - 服务不可用（版本源不可达）
    ServiceUnavailable(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::AlreadyDeploying { .. } => ApiError::Conflict(e.to_string()),
            DeployError::SourceUnreachable(_) => ApiError::ServiceUnavailable(e.to_string()),
            DeployError::RevisionUnavailable(..) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, message) = match self {
            ApiError::Unauthorized => ("unauthorized", "Invalid or missing API key".to_string()),
            ApiError::NotFound(resource) => ("not_found", format!("{} not found", resource)),
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::Conflict(msg) => ("conflict", msg),
            ApiError::Internal(msg) => ("internal_error", msg),
            ApiError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
