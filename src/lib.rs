//! eeveon - 轻量 CI/CD 部署代理
//!
//! 轮询仓库，发现新版本后按阶段部署，失败时回滚到上一个版本

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

use anyhow::Context;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::EnvConfig;
use crate::domain::{DeployOutcome, DeployTrigger, Revision};
use crate::services::release::ReleaseStore;
use crate::services::source::RevisionSource;
use crate::services::ServiceControl;
use crate::state::{AppState, AttemptStore};

/// 运行模式
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AgentCommand {
    /// 常驻：HTTP API + 轮询
    #[default]
    Run,
    /// 检查一次上游版本
    Check,
    /// 部署指定版本后退出
    Deploy(String),
    /// 打印已安装版本和最近一次部署
    Status,
}

/// 命令行覆盖的运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port_override: Option<u16>,
    pub poll_enabled: bool,
    pub command: AgentCommand,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port_override: None,
            poll_enabled: true,
            command: AgentCommand::Run,
        }
    }
}

/// 初始化日志
///
/// `RUST_LOG` 控制过滤，`LOG_FORMAT=json` 输出 JSON
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("eeveon=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

/// 加载配置并运行代理
pub async fn init_and_run_agent_with_config(runtime: RuntimeConfig) -> ExitCode {
    init_tracing();

    let result = match EnvConfig::from_env() {
        Ok(mut config) => {
            if let Some(port) = runtime.port_override {
                config.port = port;
            }
            if !runtime.poll_enabled {
                config.poll.enabled = false;
            }
            match &runtime.command {
                AgentCommand::Run => run_agent(config).await.map(|_| ExitCode::SUCCESS),
                AgentCommand::Check => run_check(config).await,
                AgentCommand::Deploy(revision) => run_deploy(config, revision).await,
                AgentCommand::Status => run_status(config).await,
            }
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "eeveon exited with error");
            ExitCode::FAILURE
        }
    }
}

/// 常驻模式
async fn run_agent(config: EnvConfig) -> anyhow::Result<()> {
    let state = Arc::new(AppState::build(&config).await?);

    let installed = state.coordinator.recover().await;
    state.poller.seed(installed).await;

    let cancel = state.shutdown.clone();

    let poller_handle = if config.poll.enabled {
        let poller = state.poller.clone();
        let coordinator = state.coordinator.clone();
        let cancel = cancel.clone();
        Some(tokio::spawn(async move { poller.run(coordinator, cancel).await }))
    } else {
        info!("Polling disabled, deploys only via API");
        None
    };

    // 定期清理已结束的日志通道
    {
        let log_hub = state.log_hub.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => log_hub.cleanup_expired(chrono::Duration::hours(1)).await,
                }
            }
        });
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(
        addr = %addr,
        version = crate::config::env::constants::VERSION,
        poll = config.poll.enabled,
        source = %state.poller.source().describe(),
        "eeveon listening"
    );

    axum::serve(listener, api::router(state.clone()))
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("HTTP server error")?;

    // 服务器退出后确保其他任务也停止
    cancel.cancel();
    if let Some(handle) = poller_handle {
        let _ = handle.await;
    }

    wait_for_deploy(&state, config.deploy.deploy_timeout).await;
    info!("eeveon stopped");
    Ok(())
}

/// 等待进行中的部署到达终态
async fn wait_for_deploy(state: &AppState, limit: Duration) {
    if !state.coordinator.is_deploying() {
        return;
    }
    info!("Waiting for in-flight deploy to finish");

    let deadline = tokio::time::Instant::now() + limit;
    while state.coordinator.is_deploying() {
        if tokio::time::Instant::now() >= deadline {
            warn!("In-flight deploy did not finish before shutdown");
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
        () = cancel.cancelled() => info!("Shutdown requested"),
    }
    cancel.cancel();
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `eeveon check`：比较上游版本与已安装版本，不部署
async fn run_check(config: EnvConfig) -> anyhow::Result<ExitCode> {
    let state = AppState::build(&config).await?;
    let installed = ReleaseStore::new(&config.deploy_root).current_revision().await;
    state.poller.seed(installed.clone()).await;

    let update = state.poller.peek_update().await?;
    print_json(&serde_json::json!({
        "installed": installed.as_ref().map(|r| r.id()),
        "update_available": update.is_some(),
        "revision": update.as_ref().map(|r| r.id()),
    }))?;
    Ok(ExitCode::SUCCESS)
}

/// `eeveon deploy <rev>`：同步执行一次部署
async fn run_deploy(config: EnvConfig, revision: &str) -> anyhow::Result<ExitCode> {
    let revision = Revision::new(revision);
    if !revision.is_path_safe() {
        anyhow::bail!("invalid revision '{}'", revision.id());
    }

    let state = AppState::build(&config).await?;
    state.coordinator.recover().await;

    let attempt = state
        .coordinator
        .deploy(revision, DeployTrigger::Cli)
        .await?;
    print_json(&attempt)?;

    Ok(if attempt.outcome == DeployOutcome::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// `eeveon status`：只读，不接管也不启动服务
async fn run_status(config: EnvConfig) -> anyhow::Result<ExitCode> {
    let releases = ReleaseStore::new(&config.deploy_root);
    let installed = releases.current_revision().await;
    let attempts = AttemptStore::open(releases.history_file()).await;

    let supervisor =
        services::ProcessSupervisor::new(config.service.clone(), releases.pid_file());
    let pid = supervisor.adopt().await;
    let health = match pid {
        Some(_) => Some(supervisor.health_check().await),
        None => None,
    };

    print_json(&serde_json::json!({
        "installed": installed.as_ref().map(|r| r.id()),
        "pid": pid,
        "health": health,
        "last_success": attempts.last_success().await,
        "recent": attempts.list(5, None).await,
    }))?;
    Ok(ExitCode::SUCCESS)
}
