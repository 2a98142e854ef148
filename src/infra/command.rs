//! 命令执行器
//!
//! 提供统一的命令执行接口，支持：
//! - 实时日志流式输出
//! - 超时控制（超时即终止子进程）
//! - stdout/stderr 分离

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::error;

use crate::domain::deploy::LogLine;

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(#[source] std::io::Error),
    /// 命令超时
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    /// 等待命令完成失败
    #[error("Failed to wait for command: {0}")]
    WaitFailed(#[source] std::io::Error),
}

/// 命令执行结果
pub struct CommandResult {
    /// 退出状态
    pub status: ExitStatus,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

impl CommandRunner {
    /// 执行命令并流式输出日志
    ///
    /// 超时后终止子进程并返回 `CommandError::Timeout`
    pub async fn run_with_streaming(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        envs: &[(&str, &str)],
        log_tx: Option<broadcast::Sender<LogLine>>,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        let mut child = Command::new(program)
            .args(args)
            .envs(envs.iter().copied())
            .current_dir(work_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandError::SpawnFailed)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // 启动 stdout 读取任务
        let stdout_tx = log_tx.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(ref tx) = stdout_tx {
                        let _ = tx.send(LogLine::stdout(line));
                    }
                }
            }
        });

        // 启动 stderr 读取任务
        let stderr_tx = log_tx;
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(ref tx) = stderr_tx {
                        let _ = tx.send(LogLine::stderr(line));
                    }
                }
            }
        });

        let result = tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                error!(program = %program, "Command timed out after {:?}", timeout);
                let _ = child.kill().await;
                Err(CommandError::Timeout(timeout))
            }
            status = child.wait() => {
                status
                    .map(|status| CommandResult { status })
                    .map_err(CommandError::WaitFailed)
            }
        };

        if result.is_err() {
            // 孙进程可能仍持有管道，不等待 EOF
            stdout_task.abort();
            stderr_task.abort();
        } else {
            // 等待日志读取完成
            let _ = stdout_task.await;
            let _ = stderr_task.await;
        }

        result
    }

    /// 执行简单命令（无流式输出）
    ///
    /// 用于需要读取 stdout 的场景（如 git ls-remote）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, CommandError> {
        let child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// 执行 shell 命令
    ///
    /// 使用 sh -c 执行命令字符串
    pub async fn run_shell_with_streaming(
        command: &str,
        work_dir: &Path,
        envs: &[(&str, &str)],
        log_tx: Option<broadcast::Sender<LogLine>>,
        timeout: Duration,
    ) -> Result<CommandResult, CommandError> {
        Self::run_with_streaming("sh", &["-c", command], work_dir, envs, log_tx, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_run_simple_success() {
        let output = CommandRunner::run_simple(
            "echo",
            &["hello"],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }

    #[tokio::test]
    async fn test_run_simple_not_found() {
        let result = CommandRunner::run_simple(
            "nonexistent_command_12345",
            &[],
            &PathBuf::from("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_shell_streaming_captures_lines_and_env() {
        let (tx, mut rx) = broadcast::channel(16);
        let result = CommandRunner::run_shell_with_streaming(
            "echo out-$EEVEON_REVISION; echo err >&2; exit 3",
            &PathBuf::from("/tmp"),
            &[("EEVEON_REVISION", "abc")],
            Some(tx),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert!(!result.success());
        assert_eq!(result.code(), 3);

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push((line.stream, line.content));
        }
        assert!(lines.contains(&("stdout".to_string(), "out-abc".to_string())));
        assert!(lines.contains(&("stderr".to_string(), "err".to_string())));
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let result = CommandRunner::run_shell_with_streaming(
            "sleep 5",
            &PathBuf::from("/tmp"),
            &[],
            None,
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(result, Err(CommandError::Timeout(_))));
    }
}
