//! 环境变量配置加载

use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

use crate::config::deploy::DeployConfig;
use crate::config::service::ServiceConfig;
use crate::config::source::{PollConfig, SourceConfig};

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// API 密钥
    pub api_key: String,
    /// 部署结果回调 URL
    pub callback_url: Option<String>,
    /// 服务监听端口
    pub port: u16,
    /// 部署根目录（releases/、current、repo.git、service.pid、history.json）
    pub deploy_root: PathBuf,
    /// 版本源
    pub source: SourceConfig,
    /// 轮询配置
    pub poll: PollConfig,
    /// 受管服务配置
    pub service: ServiceConfig,
    /// 部署流程配置
    pub deploy: DeployConfig,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        // API Key - 支持旧名称兼容
        let api_key = load_with_fallback("EEVEON_API_KEY", "API_KEY")
            .unwrap_or_else(|| "change-me-in-production".to_string());
        if env::var("EEVEON_API_KEY").is_err() && env::var("API_KEY").is_ok() {
            warn!("Deprecated environment variable API_KEY detected. Please use EEVEON_API_KEY");
        }

        let callback_url = env::var("EEVEON_CALLBACK_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string());

        let port = env_parse("PORT", 9876);

        let deploy_root = env::var("EEVEON_DEPLOY_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/opt/eeveon"));

        let source = SourceConfig::from_env().context("invalid revision source configuration")?;
        let poll = PollConfig::from_env();
        let service = ServiceConfig::from_env().context("invalid service configuration")?;
        let deploy = DeployConfig::from_env();

        Ok(Self {
            api_key,
            callback_url,
            port,
            deploy_root,
            source,
            poll,
            service,
            deploy,
        })
    }
}

/// 加载环境变量，支持 fallback
pub(crate) fn load_with_fallback(primary: &str, fallback: &str) -> Option<String> {
    env::var(primary).ok().or_else(|| env::var(fallback).ok())
}

/// 解析数值型环境变量，缺失或非法时使用默认值
pub(crate) fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key = %key, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// 解析布尔型环境变量（"1" / "true"）
pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// 常量
pub mod constants {
    /// 部署超时（秒）
    pub const DEPLOY_TIMEOUT_SECS: u64 = 1800; // 30 分钟

    /// 部署历史最大保存数量
    pub const MAX_ATTEMPT_HISTORY: usize = 100;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
