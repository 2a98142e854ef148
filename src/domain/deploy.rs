//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::revision::Revision;

/// 部署阶段（状态机）
///
/// ```text
/// Idle -> Preparing -> Stopping -> Installing -> Starting -> HealthChecking -> Success
///            |            \____________\______________\____________\-> RollingBack
///            v                                                          |-> RolledBack
///          Failed                                                       '-> FatalFailure
/// ```
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    Idle,
    Preparing,
    Stopping,
    Installing,
    Starting,
    HealthChecking,
    Success,
    /// Preparing 阶段失败，服务未被触碰
    Failed,
    RollingBack,
    RolledBack,
    FatalFailure,
}

impl DeployPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployPhase::Idle => "idle",
            DeployPhase::Preparing => "preparing",
            DeployPhase::Stopping => "stopping",
            DeployPhase::Installing => "installing",
            DeployPhase::Starting => "starting",
            DeployPhase::HealthChecking => "health_checking",
            DeployPhase::Success => "success",
            DeployPhase::Failed => "failed",
            DeployPhase::RollingBack => "rolling_back",
            DeployPhase::RolledBack => "rolled_back",
            DeployPhase::FatalFailure => "fatal_failure",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeployPhase::Success
                | DeployPhase::Failed
                | DeployPhase::RolledBack
                | DeployPhase::FatalFailure
        )
    }

    /// 是否已越过不可回退点（Stopping 之后的失败必须回滚）
    pub fn past_point_of_no_return(&self) -> bool {
        matches!(
            self,
            DeployPhase::Stopping
                | DeployPhase::Installing
                | DeployPhase::Starting
                | DeployPhase::HealthChecking
        )
    }

    /// 状态转换表
    pub fn can_transition_to(&self, next: DeployPhase) -> bool {
        use DeployPhase::*;
        match (self, next) {
            (Idle, Preparing) => true,
            (Preparing, Stopping) | (Preparing, Failed) => true,
            (Stopping, Installing) => true,
            (Installing, Starting) => true,
            (Starting, HealthChecking) => true,
            (HealthChecking, Success) => true,
            (from, RollingBack) => from.past_point_of_no_return(),
            (RollingBack, RolledBack) | (RollingBack, FatalFailure) => true,
            _ => false,
        }
    }

    /// 终态对应的结果
    pub fn outcome(&self) -> DeployOutcome {
        match self {
            DeployPhase::Success => DeployOutcome::Success,
            DeployPhase::Failed => DeployOutcome::Failed,
            DeployPhase::RolledBack => DeployOutcome::RolledBack,
            DeployPhase::FatalFailure => DeployOutcome::FatalFailure,
            _ => DeployOutcome::Pending,
        }
    }
}

/// 部署结果
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Pending,
    Success,
    Failed,
    RolledBack,
    FatalFailure,
}

impl DeployOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployOutcome::Pending => "pending",
            DeployOutcome::Success => "success",
            DeployOutcome::Failed => "failed",
            DeployOutcome::RolledBack => "rolled_back",
            DeployOutcome::FatalFailure => "fatal_failure",
        }
    }
}

/// 部署触发来源
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployTrigger {
    Poller,
    Api,
    Cli,
}

/// 一次阶段转换记录
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub phase: DeployPhase,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 部署尝试
///
/// 部署开始时创建，结束时定稿，之后保留在历史记录中
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeployAttempt {
    pub id: String,
    pub revision: Revision,
    /// 部署前正在运行的版本（回滚目标）
    pub previous_revision: Option<Revision>,
    pub trigger: DeployTrigger,
    pub phase: DeployPhase,
    pub outcome: DeployOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub transitions: Vec<PhaseTransition>,
}

/// 非法状态转换
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: DeployPhase,
    pub to: DeployPhase,
}

impl DeployAttempt {
    /// 创建新的部署尝试（Idle 阶段）
    pub fn new(
        id: String,
        revision: Revision,
        previous_revision: Option<Revision>,
        trigger: DeployTrigger,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            revision,
            previous_revision,
            trigger,
            phase: DeployPhase::Idle,
            outcome: DeployOutcome::Pending,
            started_at: now,
            finished_at: None,
            duration_ms: None,
            error: None,
            transitions: vec![PhaseTransition {
                phase: DeployPhase::Idle,
                at: now,
                message: None,
            }],
        }
    }

    /// 转换到下一阶段，记录时间戳；进入终态时定稿
    pub fn transition(
        &mut self,
        next: DeployPhase,
        message: Option<String>,
    ) -> Result<(), IllegalTransition> {
        if !self.phase.can_transition_to(next) {
            return Err(IllegalTransition {
                from: self.phase,
                to: next,
            });
        }

        let now = Utc::now();
        self.phase = next;
        self.transitions.push(PhaseTransition {
            phase: next,
            at: now,
            message,
        });

        if next.is_terminal() {
            self.outcome = next.outcome();
            self.finished_at = Some(now);
            self.duration_ms = Some((now - self.started_at).num_milliseconds());
        }
        Ok(())
    }

    /// 记录错误详情（保留第一个错误，后续错误追加）
    pub fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.error = Some(match self.error.take() {
            Some(first) => format!("{}; {}", first, error),
            None => error,
        });
    }

    /// 某阶段是否出现过
    pub fn visited(&self, phase: DeployPhase) -> bool {
        self.transitions.iter().any(|t| t.phase == phase)
    }
}

/// 日志行
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr | phase
    pub content: String,
}

impl LogLine {
    /// 创建新日志行
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    /// 创建 stdout 日志行
    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    /// 创建 stderr 日志行
    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}
