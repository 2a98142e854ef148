//! 受管服务配置

use anyhow::bail;
use std::env;
use std::time::Duration;

use super::env::{env_flag, env_parse};

/// 健康探针
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthProbe {
    /// 进程存活即健康
    Process,
    /// GET 请求返回 2xx 即健康
    Http { url: String },
    /// `sh -c <command>` 退出码为 0 即健康
    Command { command: String },
}

impl HealthProbe {
    /// 解析 `process` / `http:<url>` / `cmd:<command>`
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "process" {
            return Ok(HealthProbe::Process);
        }
        if let Some(url) = raw.strip_prefix("http:") {
            // 允许 "http:http://..." 和 "http://..." 两种写法
            let url = if url.starts_with("//") {
                format!("http:{}", url)
            } else {
                url.to_string()
            };
            return Ok(HealthProbe::Http { url });
        }
        if raw.starts_with("https://") {
            return Ok(HealthProbe::Http {
                url: raw.to_string(),
            });
        }
        if let Some(command) = raw.strip_prefix("cmd:") {
            if command.trim().is_empty() {
                bail!("empty health check command");
            }
            return Ok(HealthProbe::Command {
                command: command.to_string(),
            });
        }
        bail!(
            "unknown health probe '{}', expected process, http:<url> or cmd:<command>",
            raw
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HealthProbe::Process => "process",
            HealthProbe::Http { .. } => "http",
            HealthProbe::Command { .. } => "command",
        }
    }
}

/// 受管服务配置
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// 启动命令（在 current 目录中以 `sh -c` 执行）
    pub start_command: String,
    pub health: HealthProbe,
    /// 优雅停止宽限期
    pub stop_timeout: Duration,
    /// 单次健康探测超时
    pub probe_timeout: Duration,
    /// Agent 启动时是否拉起已安装的版本
    pub start_on_boot: bool,
}

impl ServiceConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let start_command =
            env::var("EEVEON_START_COMMAND").unwrap_or_else(|_| "./deploy.sh start".to_string());
        let health = HealthProbe::parse(&env::var("EEVEON_HEALTH").unwrap_or_default())?;

        Ok(Self {
            start_command,
            health,
            stop_timeout: Duration::from_secs(env_parse("EEVEON_STOP_TIMEOUT_SECS", 15u64)),
            probe_timeout: Duration::from_secs(env_parse("EEVEON_HEALTH_PROBE_TIMEOUT_SECS", 5u64)),
            start_on_boot: env_flag("EEVEON_START_ON_BOOT", true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_health_probe() {
        assert_eq!(HealthProbe::parse("").unwrap(), HealthProbe::Process);
        assert_eq!(HealthProbe::parse("process").unwrap(), HealthProbe::Process);
        assert_eq!(
            HealthProbe::parse("http://127.0.0.1:8080/health").unwrap(),
            HealthProbe::Http {
                url: "http://127.0.0.1:8080/health".to_string()
            }
        );
        assert_eq!(
            HealthProbe::parse("http:http://localhost/ok").unwrap(),
            HealthProbe::Http {
                url: "http://localhost/ok".to_string()
            }
        );
        assert_eq!(
            HealthProbe::parse("cmd:curl -sf localhost").unwrap(),
            HealthProbe::Command {
                command: "curl -sf localhost".to_string()
            }
        );
        assert!(HealthProbe::parse("cmd:").is_err());
        assert!(HealthProbe::parse("tcp:8080").is_err());
    }
}
