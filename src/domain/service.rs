//! 受管服务状态

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::revision::Revision;

/// 健康状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// 进程停止方式
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// 没有运行中的进程
    NotRunning,
    /// 在宽限期内正常退出
    Graceful,
    /// 超时后被强制终止
    Forced,
}

/// 服务状态
///
/// `current_revision` 只在部署成功（或回滚恢复）时由协调器修改
#[derive(Clone, Debug, Serialize, Default)]
pub struct ServiceState {
    pub current_revision: Option<Revision>,
    pub pid: Option<u32>,
    pub health: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ServiceState {
    pub fn record_health(&mut self, health: HealthStatus) {
        self.health = health;
        self.last_health_check = Some(Utc::now());
    }
}
