//! 部署协调器
//!
//! 单飞（single-flight）部署流程：
//! Preparing -> Stopping -> Installing -> Starting -> HealthChecking -> Success
//!
//! - Preparing 失败：Failed，服务未被触碰
//! - Stopping 之后的任何失败（含整体超时）：RollingBack -> RolledBack / FatalFailure
//! - 新部署请求在已有部署进行时直接拒绝（AlreadyDeploying），不排队

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

use crate::config::DeployConfig;
use crate::domain::deploy::LogLine;
use crate::domain::{
    DeployAttempt, DeployPhase, DeployTrigger, HealthStatus, Revision, ServiceState, StopOutcome,
};
use crate::error::DeployError;
use crate::infra::AttemptReporter;
use crate::services::fetcher::ArtifactFetcher;
use crate::services::release::ReleaseStore;
use crate::services::supervisor::ServiceControl;
use crate::state::{AttemptStore, LogHub};

/// 协调器依赖
pub struct CoordinatorParts {
    pub deploy: DeployConfig,
    pub stop_timeout: Duration,
    pub start_on_boot: bool,
    pub releases: Arc<ReleaseStore>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub service: Arc<dyn ServiceControl>,
    pub attempts: Arc<AttemptStore>,
    pub log_hub: Arc<LogHub>,
    pub reporter: Arc<AttemptReporter>,
}

/// 协调器状态快照
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub service: ServiceState,
    pub deploying: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<DeployAttempt>,
}

/// 单飞标志的 RAII 守卫，drop 时释放
struct FlightGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 已获得执行权的部署
///
/// 由 `begin` 创建，交给 `execute` 执行；丢弃即释放执行权
pub struct DeployTicket {
    attempt: DeployAttempt,
    _guard: FlightGuard,
}

impl DeployTicket {
    pub fn attempt_id(&self) -> &str {
        &self.attempt.id
    }

    pub fn revision(&self) -> &Revision {
        &self.attempt.revision
    }
}

/// 单次部署的执行上下文
///
/// 阶段转换同时写入 attempt、tracing、日志通道和 in-flight 快照
struct AttemptContext {
    attempt: DeployAttempt,
    log_tx: broadcast::Sender<LogLine>,
    snapshot: Arc<RwLock<Option<DeployAttempt>>>,
}

impl AttemptContext {
    fn log(&self, content: impl Into<String>) {
        let _ = self.log_tx.send(LogLine::new("deploy", content));
    }

    fn log_tx(&self) -> Option<broadcast::Sender<LogLine>> {
        Some(self.log_tx.clone())
    }

    async fn advance(&mut self, phase: DeployPhase, message: Option<String>) -> Result<(), DeployError> {
        self.attempt.transition(phase, message.clone())?;

        info!(
            attempt_id = %self.attempt.id,
            revision = %self.attempt.revision,
            phase = phase.as_str(),
            "Deploy phase"
        );
        let line = match message {
            Some(msg) => format!("{}: {}", phase.as_str(), msg),
            None => phase.as_str().to_string(),
        };
        let _ = self.log_tx.send(LogLine::new("phase", line));

        *self.snapshot.write().await = Some(self.attempt.clone());
        Ok(())
    }

    async fn record_error(&mut self, error: &DeployError) {
        self.attempt.record_error(error.to_string());
        self.log(format!("error: {}", error));
        *self.snapshot.write().await = Some(self.attempt.clone());
    }
}

/// 部署协调器
pub struct DeployCoordinator {
    config: DeployConfig,
    stop_timeout: Duration,
    start_on_boot: bool,
    releases: Arc<ReleaseStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    service: Arc<dyn ServiceControl>,
    attempts: Arc<AttemptStore>,
    log_hub: Arc<LogHub>,
    reporter: Arc<AttemptReporter>,
    /// 单飞标志
    deploying: Arc<AtomicBool>,
    /// 仅由协调器写入
    state: RwLock<ServiceState>,
    in_flight: Arc<RwLock<Option<DeployAttempt>>>,
}

impl DeployCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        Self {
            config: parts.deploy,
            stop_timeout: parts.stop_timeout,
            start_on_boot: parts.start_on_boot,
            releases: parts.releases,
            fetcher: parts.fetcher,
            service: parts.service,
            attempts: parts.attempts,
            log_hub: parts.log_hub,
            reporter: parts.reporter,
            deploying: Arc::new(AtomicBool::new(false)),
            state: RwLock::new(ServiceState::default()),
            in_flight: Arc::new(RwLock::new(None)),
        }
    }

    pub fn is_deploying(&self) -> bool {
        self.deploying.load(Ordering::Acquire)
    }

    pub async fn current_revision(&self) -> Option<Revision> {
        self.state.read().await.current_revision.clone()
    }

    pub async fn in_flight(&self) -> Option<DeployAttempt> {
        self.in_flight.read().await.clone()
    }

    pub async fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            service: self.state.read().await.clone(),
            deploying: self.is_deploying(),
            in_flight: self.in_flight.read().await.clone(),
        }
    }

    /// 启动时恢复：读取已安装版本，接管或拉起服务
    pub async fn recover(&self) -> Option<Revision> {
        match self.releases.cleanup_staging().await {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to clean staging directories"),
        }

        let installed = self.releases.current_revision().await;
        self.state.write().await.current_revision = installed.clone();

        if let Some(pid) = self.service.adopt().await {
            info!(pid, revision = ?installed.as_ref().map(|r| r.short()), "Service already running");
            self.state.write().await.pid = Some(pid);
            return installed;
        }

        match &installed {
            Some(revision) if self.start_on_boot => {
                let work_dir = self.releases.current_link();
                match self.service.start(revision, &work_dir).await {
                    Ok(pid) => {
                        info!(pid, revision = %revision, "Started installed release");
                        self.state.write().await.pid = Some(pid);
                    }
                    Err(e) => error!(revision = %revision, error = %e, "Failed to start installed release"),
                }
            }
            Some(revision) => info!(revision = %revision, "Installed release found, not starting"),
            None => info!("No release installed yet"),
        }

        installed
    }

    /// 获取执行权并创建部署尝试
    ///
    /// 已有部署进行时立即返回 `AlreadyDeploying`
    pub async fn begin(
        &self,
        revision: Revision,
        trigger: DeployTrigger,
    ) -> Result<DeployTicket, DeployError> {
        if self
            .deploying
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let (attempt_id, running) = self
                .in_flight
                .read()
                .await
                .as_ref()
                .map(|a| (a.id.clone(), a.revision.id().to_string()))
                .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
            warn!(
                revision = %revision,
                running_attempt = %attempt_id,
                "Deploy rejected, another deploy is in progress"
            );
            return Err(DeployError::AlreadyDeploying {
                attempt_id,
                revision: running,
            });
        }
        let guard = FlightGuard {
            flag: self.deploying.clone(),
        };

        let previous = self.state.read().await.current_revision.clone();
        let attempt = DeployAttempt::new(
            uuid::Uuid::new_v4().to_string(),
            revision,
            previous,
            trigger,
        );

        self.log_hub.create(&attempt.id).await;
        *self.in_flight.write().await = Some(attempt.clone());

        info!(
            attempt_id = %attempt.id,
            revision = %attempt.revision,
            previous = ?attempt.previous_revision.as_ref().map(|r| r.short()),
            trigger = ?trigger,
            "Deploy accepted"
        );

        Ok(DeployTicket {
            attempt,
            _guard: guard,
        })
    }

    /// 部署：`begin` + `execute`
    pub async fn deploy(
        &self,
        revision: Revision,
        trigger: DeployTrigger,
    ) -> Result<DeployAttempt, DeployError> {
        let ticket = self.begin(revision, trigger).await?;
        Ok(self.execute(ticket).await)
    }

    /// 执行部署直到终态
    pub async fn execute(&self, ticket: DeployTicket) -> DeployAttempt {
        let DeployTicket { attempt, _guard } = ticket;
        let log_tx = self.log_hub.create(&attempt.id).await;
        let mut ctx = AttemptContext {
            attempt,
            log_tx,
            snapshot: self.in_flight.clone(),
        };

        let deploy_timeout = self.config.deploy_timeout;
        let result = match tokio::time::timeout(deploy_timeout, self.forward(&mut ctx)).await {
            Ok(result) => result,
            Err(_) => Err(DeployError::Timeout(deploy_timeout)),
        };

        if let Err(e) = result {
            self.recover_from(&mut ctx, e).await;
        }

        self.finalize(ctx).await
    }

    async fn forward(&self, ctx: &mut AttemptContext) -> Result<(), DeployError> {
        ctx.advance(DeployPhase::Preparing, None).await?;
        let revision = self.fetcher.validate(&ctx.attempt.revision).await?;
        if revision.id() != ctx.attempt.revision.id() {
            ctx.log(format!("resolved {} to {}", ctx.attempt.revision.id(), revision.id()));
            ctx.attempt.revision = revision.clone();
        }

        ctx.advance(DeployPhase::Stopping, None).await?;
        match self.service.stop(self.stop_timeout).await? {
            StopOutcome::Forced => {
                let e = DeployError::StopTimeout(self.stop_timeout);
                warn!(attempt_id = %ctx.attempt.id, error = %e, "Service was force-killed");
                ctx.record_error(&e).await;
            }
            outcome => ctx.log(format!("stop: {:?}", outcome)),
        }
        self.set_pid(None).await;

        ctx.advance(DeployPhase::Installing, None).await?;
        self.releases
            .prepare(
                &revision,
                self.fetcher.as_ref(),
                self.config.install_command.as_deref(),
                ctx.log_tx(),
                self.config.fetch_timeout,
            )
            .await?;
        self.releases.activate(&revision).await?;

        ctx.advance(DeployPhase::Starting, None).await?;
        let pid = self
            .service
            .start(&revision, &self.releases.current_link())
            .await?;
        self.set_pid(Some(pid)).await;
        ctx.log(format!("started pid {}", pid));

        ctx.advance(DeployPhase::HealthChecking, None).await?;
        self.verify_health(ctx).await?;

        ctx.advance(DeployPhase::Success, None).await?;
        self.state.write().await.current_revision = Some(revision);
        Ok(())
    }

    /// 按失败时所处阶段决定终态
    async fn recover_from(&self, ctx: &mut AttemptContext, error: DeployError) {
        ctx.record_error(&error).await;
        warn!(
            attempt_id = %ctx.attempt.id,
            phase = ctx.attempt.phase.as_str(),
            error = %error,
            "Deploy step failed"
        );

        let next = if ctx.attempt.phase.past_point_of_no_return() {
            DeployPhase::RollingBack
        } else {
            DeployPhase::Failed
        };

        if let Err(e) = ctx.advance(next, Some(error.to_string())).await {
            // 只有在非法状态下才会到这里
            error!(attempt_id = %ctx.attempt.id, error = %e, "Cannot leave failed phase");
            return;
        }

        if next == DeployPhase::RollingBack {
            let terminal = match self.rollback(ctx).await {
                Ok(()) => DeployPhase::RolledBack,
                Err(e) => {
                    let fatal = match e {
                        DeployError::FatalFailure(_) => e,
                        other => DeployError::FatalFailure(other.to_string()),
                    };
                    error!(
                        attempt_id = %ctx.attempt.id,
                        error = %fatal,
                        "Rollback failed, manual intervention required"
                    );
                    ctx.record_error(&fatal).await;
                    DeployPhase::FatalFailure
                }
            };
            if let Err(e) = ctx.advance(terminal, None).await {
                error!(attempt_id = %ctx.attempt.id, error = %e, "Cannot finish rollback");
            }
        }
    }

    /// 回滚到部署前的版本
    async fn rollback(&self, ctx: &mut AttemptContext) -> Result<(), DeployError> {
        match self.service.stop(self.stop_timeout).await? {
            StopOutcome::Forced => ctx.log("rollback: new service force-killed"),
            outcome => ctx.log(format!("rollback: stop {:?}", outcome)),
        }
        self.set_pid(None).await;

        let previous = ctx.attempt.previous_revision.clone().ok_or_else(|| {
            DeployError::FatalFailure("no previous release to roll back to".to_string())
        })?;
        if !self.releases.has_release(&previous).await {
            return Err(DeployError::FatalFailure(format!(
                "previous release {} is missing",
                previous.short()
            )));
        }

        ctx.log(format!("rollback: activating {}", previous.short()));
        self.releases.activate(&previous).await?;

        let pid = self
            .service
            .start(&previous, &self.releases.current_link())
            .await?;
        self.set_pid(Some(pid)).await;

        self.verify_health(ctx).await?;
        self.state.write().await.current_revision = Some(previous);
        Ok(())
    }

    /// 有界的健康检查：初始等待后最多探测 `health_retries` 次
    async fn verify_health(&self, ctx: &AttemptContext) -> Result<(), DeployError> {
        let retries = self.config.health_retries.max(1);
        let probes = async {
            tokio::time::sleep(self.config.health_initial_delay).await;
            for attempt in 1..=retries {
                let status = self.service.health_check().await;
                self.record_health(status).await;
                if status.is_healthy() {
                    ctx.log(format!("health probe {}/{}: healthy", attempt, retries));
                    return Ok(());
                }
                ctx.log(format!("health probe {}/{}: {:?}", attempt, retries, status));
                if attempt < retries {
                    tokio::time::sleep(self.config.health_interval).await;
                }
            }
            Err(DeployError::HealthCheckFailure(format!(
                "unhealthy after {} probes",
                retries
            )))
        };

        match tokio::time::timeout(self.config.health_timeout, probes).await {
            Ok(result) => result,
            Err(_) => {
                self.record_health(HealthStatus::Unhealthy).await;
                Err(DeployError::HealthCheckFailure(format!(
                    "no healthy probe within {:?}",
                    self.config.health_timeout
                )))
            }
        }
    }

    async fn set_pid(&self, pid: Option<u32>) {
        self.state.write().await.pid = pid;
    }

    async fn record_health(&self, status: HealthStatus) {
        self.state.write().await.record_health(status);
    }

    /// 终态处理：写历史、关闭日志通道、上报、清理旧版本
    async fn finalize(&self, ctx: AttemptContext) -> DeployAttempt {
        let AttemptContext { attempt, log_tx, .. } = ctx;

        match attempt.phase {
            DeployPhase::Success => info!(
                attempt_id = %attempt.id,
                revision = %attempt.revision,
                outcome = attempt.outcome.as_str(),
                duration_ms = attempt.duration_ms.unwrap_or_default(),
                "Deploy finished"
            ),
            _ => warn!(
                attempt_id = %attempt.id,
                revision = %attempt.revision,
                outcome = attempt.outcome.as_str(),
                duration_ms = attempt.duration_ms.unwrap_or_default(),
                error = attempt.error.as_deref().unwrap_or(""),
                "Deploy finished"
            ),
        }

        let _ = log_tx.send(LogLine::new("deploy", format!("outcome: {}", attempt.outcome.as_str())));
        drop(log_tx);

        self.attempts.record(attempt.clone()).await;
        self.log_hub.finish(&attempt.id).await;
        *self.in_flight.write().await = None;

        if self.reporter.has_callback() {
            let reporter = self.reporter.clone();
            let report = attempt.clone();
            tokio::spawn(async move {
                if let Err(e) = reporter.report(&report).await {
                    warn!(attempt_id = %report.id, error = %e, "Failed to report deploy attempt");
                }
            });
        }

        if attempt.phase == DeployPhase::Success {
            let mut protect = vec![&attempt.revision];
            if let Some(previous) = attempt.previous_revision.as_ref() {
                protect.push(previous);
            }
            if let Err(e) = self.releases.prune(self.config.keep_releases, &protect).await {
                warn!(error = %e, "Failed to prune old releases");
            }
        }

        attempt
    }
}
