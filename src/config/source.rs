//! 版本源与轮询配置

use anyhow::{anyhow, bail};
use std::env;
use std::time::Duration;

use super::env::{env_flag, env_parse};

/// 版本源
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceConfig {
    /// `git ls-remote <repo_url> refs/heads/<branch>`
    Git { repo_url: String, branch: String },
    /// HTTP JSON manifest：`{"revision": "..."}`，制品仍从 git 仓库获取
    Http {
        manifest_url: String,
        repo_url: String,
    },
}

impl SourceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let repo_url = env::var("EEVEON_REPO_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("EEVEON_REPO_URL is required"))?;

        let kind = env::var("EEVEON_SOURCE").unwrap_or_else(|_| "git".to_string());
        match kind.as_str() {
            "git" => Ok(SourceConfig::Git {
                repo_url,
                branch: env::var("EEVEON_BRANCH").unwrap_or_else(|_| "main".to_string()),
            }),
            "http" => {
                let manifest_url = env::var("EEVEON_MANIFEST_URL")
                    .map_err(|_| anyhow!("EEVEON_MANIFEST_URL is required when EEVEON_SOURCE=http"))?;
                Ok(SourceConfig::Http {
                    manifest_url,
                    repo_url,
                })
            }
            other => bail!("unknown EEVEON_SOURCE '{}', expected git or http", other),
        }
    }

    /// 制品所在仓库
    pub fn repo_url(&self) -> &str {
        match self {
            SourceConfig::Git { repo_url, .. } | SourceConfig::Http { repo_url, .. } => repo_url,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Git { .. } => "git",
            SourceConfig::Http { .. } => "http",
        }
    }
}

/// 轮询配置
#[derive(Clone, Debug)]
pub struct PollConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// 失败后首次退避
    pub backoff_initial: Duration,
    /// 退避上限
    pub backoff_max: Duration,
    /// 单次检查超时
    pub check_timeout: Duration,
}

impl PollConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag("EEVEON_POLL_ENABLED", true),
            interval: Duration::from_secs(env_parse("EEVEON_POLL_INTERVAL_SECS", 60u64).max(1)),
            backoff_initial: Duration::from_secs(env_parse("EEVEON_BACKOFF_INITIAL_SECS", 5u64)),
            backoff_max: Duration::from_secs(env_parse("EEVEON_BACKOFF_MAX_SECS", 300u64)),
            check_timeout: Duration::from_secs(env_parse("EEVEON_CHECK_TIMEOUT_SECS", 30u64)),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            check_timeout: Duration::from_secs(30),
        }
    }
}
