//! 部署结果上报 HTTP Client
//!
//! 每个部署尝试结束后，将结构化记录 POST 到回调地址，复用连接池

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::deploy::{DeployAttempt, PhaseTransition};

/// 最大上报次数
const MAX_NOTIFY_ATTEMPTS: u32 = 3;

/// 结果上报客户端
#[derive(Clone)]
pub struct AttemptReporter {
    client: Client,
    callback_url: Option<String>,
    agent: String,
    retry_delay: Duration,
}

/// 上报错误类型
#[derive(Debug, Error)]
pub enum NotifyError {
    /// 网络错误
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    /// 服务端返回非成功状态码
    #[error("Server returned non-success status")]
    NonSuccessStatus,
}

/// 上报请求体
#[derive(Debug, Serialize)]
pub struct AttemptReport<'a> {
    pub agent: &'a str,
    pub attempt_id: &'a str,
    pub revision: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_revision: Option<&'a str>,
    pub outcome: &'static str,
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
    pub transitions: &'a [PhaseTransition],
}

impl<'a> AttemptReport<'a> {
    pub fn from_attempt(agent: &'a str, attempt: &'a DeployAttempt) -> Self {
        Self {
            agent,
            attempt_id: &attempt.id,
            revision: attempt.revision.id(),
            previous_revision: attempt.previous_revision.as_ref().map(|r| r.id()),
            outcome: attempt.outcome.as_str(),
            duration_ms: attempt.duration_ms,
            error: attempt.error.as_deref(),
            transitions: &attempt.transitions,
        }
    }
}

impl AttemptReporter {
    /// 创建新的上报客户端
    ///
    /// # Arguments
    /// * `callback_url` - 回调 URL（可选，未配置时上报为空操作）
    pub fn new(callback_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to create HTTP client");

        let agent = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            client,
            callback_url,
            agent,
            retry_delay: Duration::from_secs(2),
        }
    }

    /// 检查是否配置了回调 URL
    pub fn has_callback(&self) -> bool {
        self.callback_url.is_some()
    }

    pub fn callback_url(&self) -> Option<&str> {
        self.callback_url.as_deref()
    }

    /// 上报部署尝试（带重试）
    pub async fn report(&self, attempt: &DeployAttempt) -> Result<(), NotifyError> {
        let Some(ref base) = self.callback_url else {
            return Ok(()); // 未配置回调 URL，静默返回
        };

        let url = format!("{}/api/deploy/attempts", base);
        let body = AttemptReport::from_attempt(&self.agent, attempt);
        let mut last_error = None;

        for n in 1..=MAX_NOTIFY_ATTEMPTS {
            match self
                .client
                .post(&url)
                .timeout(Duration::from_secs(10))
                .json(&body)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        attempt_id = %attempt.id,
                        outcome = %body.outcome,
                        try_count = n,
                        "Reported deploy attempt"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(
                        attempt_id = %attempt.id,
                        status = %resp.status(),
                        try_count = n,
                        "Callback returned non-success status"
                    );
                }
                Err(e) => {
                    warn!(
                        attempt_id = %attempt.id,
                        error = %e,
                        try_count = n,
                        "Failed to report deploy attempt, will retry"
                    );
                    last_error = Some(e);
                }
            }

            if n < MAX_NOTIFY_ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        error!(
            attempt_id = %attempt.id,
            "Failed to report deploy attempt after {} tries",
            MAX_NOTIFY_ATTEMPTS
        );

        match last_error {
            Some(e) => Err(NotifyError::Network(e)),
            None => Err(NotifyError::NonSuccessStatus),
        }
    }
}
