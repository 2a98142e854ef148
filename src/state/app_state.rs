//! 应用状态

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{EnvConfig, SourceConfig};
use crate::infra::AttemptReporter;
use crate::services::{
    coordinator::{CoordinatorParts, DeployCoordinator},
    fetcher::GitArtifactFetcher,
    poller::Poller,
    release::ReleaseStore,
    source::{GitRemoteSource, HttpManifestSource, RevisionSource},
    supervisor::ProcessSupervisor,
};

use super::attempt_store::AttemptStore;
use super::log_hub::LogHub;

/// 应用状态
///
/// 通过 axum `State` 传给 handlers；协调器是唯一写入服务状态的地方
pub struct AppState {
    /// API 密钥（用于验证请求）
    pub api_key: String,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 部署 ==========
    pub coordinator: Arc<DeployCoordinator>,
    pub poller: Arc<Poller>,
    /// 真实进程的 supervisor（用于日志查看）
    pub supervisor: Option<Arc<ProcessSupervisor>>,

    // ========== 历史与日志 ==========
    pub attempts: Arc<AttemptStore>,
    pub log_hub: Arc<LogHub>,

    /// 关闭信号
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        api_key: impl Into<String>,
        coordinator: Arc<DeployCoordinator>,
        poller: Arc<Poller>,
        attempts: Arc<AttemptStore>,
        log_hub: Arc<LogHub>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            started_at: Utc::now(),
            coordinator,
            poller,
            supervisor: None,
            attempts,
            log_hub,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_supervisor(mut self, supervisor: Arc<ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// 按配置组装全部组件
    pub async fn build(config: &EnvConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.deploy_root)
            .await
            .with_context(|| format!("cannot create deploy root {}", config.deploy_root.display()))?;

        let releases = Arc::new(ReleaseStore::new(&config.deploy_root));
        let attempts = Arc::new(AttemptStore::open(releases.history_file()).await);
        let log_hub = Arc::new(LogHub::new());
        let reporter = Arc::new(AttemptReporter::new(config.callback_url.clone()));

        let supervisor = Arc::new(ProcessSupervisor::new(
            config.service.clone(),
            releases.pid_file(),
        ));
        let fetcher = Arc::new(GitArtifactFetcher::new(
            config.source.repo_url(),
            releases.mirror_dir(),
            config.deploy.fetch_timeout,
            config.deploy.fetch_attempts,
        ));

        let source: Arc<dyn RevisionSource> = match &config.source {
            SourceConfig::Git { repo_url, branch } => Arc::new(GitRemoteSource::new(
                repo_url.clone(),
                branch.clone(),
                config.poll.check_timeout,
            )),
            SourceConfig::Http { manifest_url, .. } => Arc::new(HttpManifestSource::new(
                manifest_url.clone(),
                config.poll.check_timeout,
            )),
        };

        let coordinator = Arc::new(DeployCoordinator::new(CoordinatorParts {
            deploy: config.deploy.clone(),
            stop_timeout: config.service.stop_timeout,
            start_on_boot: config.service.start_on_boot,
            releases,
            fetcher,
            service: supervisor.clone(),
            attempts: attempts.clone(),
            log_hub: log_hub.clone(),
            reporter,
        }));
        let poller = Arc::new(Poller::new(source, config.poll.clone()));

        info!(
            deploy_root = %config.deploy_root.display(),
            source = config.source.kind(),
            health = config.service.health.kind(),
            history = attempts.count().await,
            "Agent state initialized"
        );

        Ok(Self::new(config.api_key.clone(), coordinator, poller, attempts, log_hub)
            .with_supervisor(supervisor))
    }
}
