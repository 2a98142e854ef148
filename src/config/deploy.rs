//! 部署流程配置

use std::env;
use std::time::Duration;

use super::env::constants::DEPLOY_TIMEOUT_SECS;
use super::env::env_parse;

/// 部署流程配置
#[derive(Clone, Debug)]
pub struct DeployConfig {
    /// 在暂存目录中执行的安装/构建命令（如 `./deploy.sh build`）
    pub install_command: Option<String>,
    /// 健康检查最大探测次数
    pub health_retries: u32,
    /// 两次探测之间的间隔
    pub health_interval: Duration,
    /// 启动后首次探测前的等待
    pub health_initial_delay: Duration,
    /// 整个 HealthChecking 阶段的超时
    pub health_timeout: Duration,
    /// git 命令与安装命令的超时
    pub fetch_timeout: Duration,
    /// 获取制品的最大尝试次数
    pub fetch_attempts: u32,
    /// 整个部署的超时
    pub deploy_timeout: Duration,
    /// 保留的历史 release 数量
    pub keep_releases: usize,
}

impl DeployConfig {
    pub fn from_env() -> Self {
        let install_command = env::var("EEVEON_INSTALL_COMMAND")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Self {
            install_command,
            health_retries: env_parse("EEVEON_HEALTH_RETRIES", 3u32).max(1),
            health_interval: Duration::from_secs(env_parse("EEVEON_HEALTH_INTERVAL_SECS", 2u64)),
            health_initial_delay: Duration::from_secs(env_parse(
                "EEVEON_HEALTH_INITIAL_DELAY_SECS",
                1u64,
            )),
            health_timeout: Duration::from_secs(env_parse("EEVEON_HEALTH_TIMEOUT_SECS", 60u64)),
            fetch_timeout: Duration::from_secs(env_parse("EEVEON_FETCH_TIMEOUT_SECS", 300u64)),
            fetch_attempts: env_parse("EEVEON_FETCH_ATTEMPTS", 3u32).max(1),
            deploy_timeout: Duration::from_secs(env_parse(
                "EEVEON_DEPLOY_TIMEOUT_SECS",
                DEPLOY_TIMEOUT_SECS,
            )),
            keep_releases: env_parse("EEVEON_KEEP_RELEASES", 5usize),
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            install_command: None,
            health_retries: 3,
            health_interval: Duration::from_secs(2),
            health_initial_delay: Duration::from_secs(1),
            health_timeout: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(300),
            fetch_attempts: 3,
            deploy_timeout: Duration::from_secs(DEPLOY_TIMEOUT_SECS),
            keep_releases: 5,
        }
    }
}
