//! Release 目录管理
//!
//! ```text
//! <deploy_root>/
//!   releases/<rev>/            已安装的版本
//!   releases/.staging-<rev>-*  安装中的暂存目录
//!   current -> releases/<rev>  当前版本（原子替换的符号链接）
//!   repo.git/                  git 镜像
//!   service.pid
//!   history.json
//! ```
//!
//! `current` 是「已安装版本」的唯一事实来源，Agent 重启后据此恢复

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::deploy::LogLine;
use crate::domain::Revision;
use crate::error::DeployError;
use crate::infra::command::{CommandError, CommandRunner};
use crate::services::fetcher::ArtifactFetcher;

const RELEASES_DIR: &str = "releases";
const CURRENT_LINK: &str = "current";
const STAGING_PREFIX: &str = ".staging-";

/// Release 存储
pub struct ReleaseStore {
    root: PathBuf,
}

impl ReleaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn releases_dir(&self) -> PathBuf {
        self.root.join(RELEASES_DIR)
    }

    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.root.join("repo.git")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("service.pid")
    }

    pub fn history_file(&self) -> PathBuf {
        self.root.join("history.json")
    }

    pub fn release_dir(&self, revision: &Revision) -> PathBuf {
        self.releases_dir().join(revision.id())
    }

    pub async fn has_release(&self, revision: &Revision) -> bool {
        fs::metadata(self.release_dir(revision))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// 读取 `current` 指向的版本
    pub async fn current_revision(&self) -> Option<Revision> {
        let target = fs::read_link(self.current_link()).await.ok()?;
        let name = target.file_name()?.to_str()?;
        let revision = Revision::new(name);
        revision.is_path_safe().then_some(revision)
    }

    /// 准备 release 目录：暂存目录中获取制品并执行安装命令，成功后提升为 `releases/<rev>`
    ///
    /// 已存在的 `releases/<rev>` 一定是完整安装过的，直接复用
    pub async fn prepare(
        &self,
        revision: &Revision,
        fetcher: &dyn ArtifactFetcher,
        install_command: Option<&str>,
        log_tx: Option<broadcast::Sender<LogLine>>,
        install_timeout: Duration,
    ) -> Result<PathBuf, DeployError> {
        if !revision.is_path_safe() {
            return Err(DeployError::InstallFailure(format!(
                "revision '{}' is not a valid directory name",
                revision.id()
            )));
        }

        let target = self.release_dir(revision);
        if self.has_release(revision).await {
            info!(revision = %revision, "Release already installed, reusing");
            send(&log_tx, format!("release {} already installed", revision.short()));
            return Ok(target);
        }

        fs::create_dir_all(self.releases_dir()).await?;
        let staging = self.releases_dir().join(format!(
            "{}{}-{}",
            STAGING_PREFIX,
            revision.id(),
            uuid::Uuid::new_v4().simple()
        ));

        let result = self
            .install_into(&staging, revision, fetcher, install_command, log_tx, install_timeout)
            .await;

        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_dir_all(&staging).await {
                debug!(path = %staging.display(), error = %cleanup, "Failed to remove staging dir");
            }
            return Err(e);
        }

        fs::rename(&staging, &target).await.map_err(|e| {
            DeployError::InstallFailure(format!("failed to promote release: {}", e))
        })?;
        info!(revision = %revision, path = %target.display(), "Release installed");
        Ok(target)
    }

    async fn install_into(
        &self,
        staging: &Path,
        revision: &Revision,
        fetcher: &dyn ArtifactFetcher,
        install_command: Option<&str>,
        log_tx: Option<broadcast::Sender<LogLine>>,
        install_timeout: Duration,
    ) -> Result<(), DeployError> {
        fetcher.materialize(revision, staging, log_tx.clone()).await?;

        let Some(command) = install_command else {
            return Ok(());
        };

        send(&log_tx, format!("$ {}", command));
        let result = CommandRunner::run_shell_with_streaming(
            command,
            staging,
            &[("EEVEON_REVISION", revision.id())],
            log_tx,
            install_timeout,
        )
        .await
        .map_err(|e| match e {
            CommandError::Timeout(t) => {
                DeployError::InstallFailure(format!("install command timed out after {:?}", t))
            }
            other => DeployError::InstallFailure(other.to_string()),
        })?;

        if !result.success() {
            return Err(DeployError::InstallFailure(format!(
                "install command exited with code {}",
                result.code()
            )));
        }
        Ok(())
    }

    /// 原子地将 `current` 指向 `releases/<rev>`
    ///
    /// 先创建临时链接，再 rename 覆盖 `current`
    pub async fn activate(&self, revision: &Revision) -> Result<(), DeployError> {
        if !self.has_release(revision).await {
            return Err(DeployError::InstallFailure(format!(
                "release {} is not installed",
                revision.short()
            )));
        }

        let target = PathBuf::from(RELEASES_DIR).join(revision.id());
        let tmp_link = self
            .root
            .join(format!("{}.tmp-{}", CURRENT_LINK, uuid::Uuid::new_v4().simple()));

        symlink(&target, &tmp_link).await?;
        if let Err(e) = fs::rename(&tmp_link, self.current_link()).await {
            let _ = fs::remove_file(&tmp_link).await;
            return Err(DeployError::InstallFailure(format!(
                "failed to switch current release: {}",
                e
            )));
        }

        info!(revision = %revision, "Activated release");
        Ok(())
    }

    /// 删除上次崩溃遗留的暂存目录和临时链接
    pub async fn cleanup_staging(&self) -> std::io::Result<usize> {
        let mut removed = 0;

        if let Ok(mut entries) = fs::read_dir(self.releases_dir()).await {
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(STAGING_PREFIX) {
                    fs::remove_dir_all(entry.path()).await?;
                    removed += 1;
                }
            }
        }

        if let Ok(mut entries) = fs::read_dir(&self.root).await {
            let tmp_prefix = format!("{}.tmp-", CURRENT_LINK);
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().starts_with(&tmp_prefix) {
                    fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "Removed leftover staging entries");
        }
        Ok(removed)
    }

    /// 保留最新的 `keep` 个 release，`protect` 中的版本永不删除
    pub async fn prune(&self, keep: usize, protect: &[&Revision]) -> std::io::Result<Vec<String>> {
        let mut releases: Vec<(String, SystemTime)> = Vec::new();

        let mut entries = match fs::read_dir(self.releases_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                releases.push((name, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
            }
        }

        // 最新的在前
        releases.sort_by(|a, b| b.1.cmp(&a.1));

        let mut removed = Vec::new();
        for (name, _) in releases.into_iter().skip(keep) {
            if protect.iter().any(|r| r.id() == name) {
                continue;
            }
            match fs::remove_dir_all(self.releases_dir().join(&name)).await {
                Ok(()) => removed.push(name),
                Err(e) => warn!(release = %name, error = %e, "Failed to prune release"),
            }
        }

        if !removed.is_empty() {
            info!(count = removed.len(), "Pruned old releases");
        }
        Ok(removed)
    }
}

fn send(log_tx: &Option<broadcast::Sender<LogLine>>, content: String) {
    if let Some(tx) = log_tx {
        let _ = tx.send(LogLine::new("deploy", content));
    }
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    fs::symlink_dir(target, link).await
}
