//! 制品获取
//!
//! git 实现在 `<deploy_root>/repo.git` 维护一个 bare 镜像：
//! - `validate`：把版本解析为 commit hash（`git rev-parse <rev>^{commit}`）；
//!   完整 hash 已在镜像中时不 fetch，分支/标签名每次都先同步镜像
//! - `materialize`：`git clone --shared` + `git checkout --detach <hash>`
//!
//! 网络操作带超时，失败后按退避重试

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::domain::deploy::LogLine;
use crate::domain::Revision;
use crate::error::DeployError;
use crate::infra::command::CommandRunner;
use crate::services::backoff::Backoff;

/// 制品获取
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// 确认版本可获取（Preparing 阶段），返回之后各阶段使用的确定版本
    ///
    /// 失败返回 `RevisionUnavailable`
    async fn validate(&self, revision: &Revision) -> Result<Revision, DeployError>;

    /// 将版本内容写入 `dest`（不存在的目录），失败返回 `InstallFailure`
    async fn materialize(
        &self,
        revision: &Revision,
        dest: &Path,
        log_tx: Option<broadcast::Sender<LogLine>>,
    ) -> Result<(), DeployError>;
}

/// 基于 git 镜像的制品获取
pub struct GitArtifactFetcher {
    repo_url: String,
    mirror_dir: PathBuf,
    timeout: Duration,
    attempts: u32,
    retry_initial: Duration,
    /// 串行化镜像更新
    mirror_lock: Mutex<()>,
}

impl GitArtifactFetcher {
    pub fn new(
        repo_url: impl Into<String>,
        mirror_dir: impl Into<PathBuf>,
        timeout: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            repo_url: repo_url.into(),
            mirror_dir: mirror_dir.into(),
            timeout,
            attempts: attempts.max(1),
            retry_initial: Duration::from_secs(2),
            mirror_lock: Mutex::new(()),
        }
    }

    pub fn with_retry_delay(mut self, initial: Duration) -> Self {
        self.retry_initial = initial;
        self
    }

    fn mirror_exists(&self) -> bool {
        self.mirror_dir.join("HEAD").exists()
    }

    /// 在镜像中把版本解析为 commit hash
    async fn resolve_commit(&self, revision: &Revision) -> Option<String> {
        if !self.mirror_exists() {
            return None;
        }
        let object = format!("{}^{{commit}}", revision.id());
        let output = CommandRunner::run_simple(
            "git",
            &["rev-parse", "--verify", "--quiet", &object],
            &self.mirror_dir,
            self.timeout,
        )
        .await
        .ok()?;
        if !output.status.success() {
            return None;
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!hash.is_empty()).then_some(hash)
    }

    /// 克隆或更新镜像，失败时退避重试
    async fn sync_mirror(&self, log_tx: Option<broadcast::Sender<LogLine>>) -> Result<(), String> {
        let _lock = self.mirror_lock.lock().await;
        let mut backoff = Backoff::new(self.retry_initial, self.retry_initial * 8);
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.sync_once(log_tx.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e;
                    if attempt < self.attempts {
                        let delay = backoff.next_delay();
                        warn!(
                            attempt,
                            max_attempts = self.attempts,
                            error = %last_error,
                            "Mirror sync failed, retrying in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error)
    }

    async fn sync_once(&self, log_tx: Option<broadcast::Sender<LogLine>>) -> Result<(), String> {
        let (args, work_dir): (Vec<String>, PathBuf) = if self.mirror_exists() {
            (
                vec!["fetch".into(), "--prune".into(), "origin".into()],
                self.mirror_dir.clone(),
            )
        } else {
            let parent = self
                .mirror_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir);
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
            // 上次中断的克隆
            if self.mirror_dir.exists() {
                let _ = tokio::fs::remove_dir_all(&self.mirror_dir).await;
            }
            (
                vec![
                    "clone".into(),
                    "--mirror".into(),
                    self.repo_url.clone(),
                    self.mirror_dir.to_string_lossy().to_string(),
                ],
                parent,
            )
        };

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let result =
            CommandRunner::run_with_streaming("git", &args, &work_dir, &[], log_tx, self.timeout)
                .await
                .map_err(|e| e.to_string())?;

        if result.success() {
            Ok(())
        } else {
            Err(format!("git {} exited with code {}", args[0], result.code()))
        }
    }

    async fn git_step(
        &self,
        args: &[&str],
        work_dir: &Path,
        log_tx: Option<broadcast::Sender<LogLine>>,
    ) -> Result<(), DeployError> {
        let result =
            CommandRunner::run_with_streaming("git", args, work_dir, &[], log_tx, self.timeout)
                .await
                .map_err(|e| DeployError::InstallFailure(e.to_string()))?;
        if !result.success() {
            return Err(DeployError::InstallFailure(format!(
                "git {} exited with code {}",
                args[0],
                result.code()
            )));
        }
        Ok(())
    }
}

/// 40 位（SHA-1）或 64 位（SHA-256）十六进制 commit id
fn is_full_hash(id: &str) -> bool {
    matches!(id.len(), 40 | 64) && id.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl ArtifactFetcher for GitArtifactFetcher {
    async fn validate(&self, revision: &Revision) -> Result<Revision, DeployError> {
        if !revision.is_path_safe() {
            return Err(DeployError::RevisionUnavailable(
                revision.id().to_string(),
                "not a valid revision identifier".to_string(),
            ));
        }

        // 完整 hash 不会移动，已在镜像中即可直接使用
        if is_full_hash(revision.id()) {
            if let Some(hash) = self.resolve_commit(revision).await {
                return Ok(Revision::discovered_at(hash, revision.discovered()));
            }
        }

        info!(revision = %revision, repo = %self.repo_url, "Fetching revision into mirror");
        self.sync_mirror(None)
            .await
            .map_err(|e| DeployError::RevisionUnavailable(revision.id().to_string(), e))?;

        match self.resolve_commit(revision).await {
            Some(hash) => {
                if hash != revision.id() {
                    info!(revision = %revision, commit = %hash, "Resolved revision to commit");
                }
                Ok(Revision::discovered_at(hash, revision.discovered()))
            }
            None => Err(DeployError::RevisionUnavailable(
                revision.id().to_string(),
                "commit not found in repository".to_string(),
            )),
        }
    }

    async fn materialize(
        &self,
        revision: &Revision,
        dest: &Path,
        log_tx: Option<broadcast::Sender<LogLine>>,
    ) -> Result<(), DeployError> {
        if self.resolve_commit(revision).await.is_none() {
            self.sync_mirror(log_tx.clone())
                .await
                .map_err(DeployError::InstallFailure)?;
        }

        let parent = dest.parent().unwrap_or(dest);
        let mirror = self.mirror_dir.to_string_lossy().to_string();
        let dest_str = dest.to_string_lossy().to_string();

        self.git_step(
            &["clone", "--shared", "--no-checkout", "--quiet", &mirror, &dest_str],
            parent,
            log_tx.clone(),
        )
        .await?;
        self.git_step(
            &["checkout", "--detach", "--quiet", revision.id()],
            dest,
            log_tx,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::release::ReleaseStore;
    use std::process::Command;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(["-c", "user.name=eeveon", "-c", "user.email=eeveon@localhost"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {:?} failed", args);
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// 创建一个带一次提交的本地仓库，返回 (仓库路径, commit hash)
    fn init_repo(root: &Path) -> (PathBuf, String) {
        let repo = root.join("upstream");
        std::fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "--quiet"]);
        git(&repo, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        std::fs::write(repo.join("app.txt"), "v1").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "--quiet", "-m", "v1"]);
        let hash = git(&repo, &["rev-parse", "HEAD"]);
        (repo, hash)
    }

    #[tokio::test]
    async fn test_validate_and_materialize() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, hash) = init_repo(dir.path());

        let fetcher = GitArtifactFetcher::new(
            repo.to_string_lossy(),
            dir.path().join("repo.git"),
            Duration::from_secs(30),
            1,
        );

        let revision = fetcher.validate(&Revision::new(&hash)).await.unwrap();
        assert_eq!(revision.id(), hash);

        let dest = dir.path().join("checkout");
        fetcher.materialize(&revision, &dest, None).await.unwrap();
        assert_eq!(std::fs::read_to_string(dest.join("app.txt")).unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_branch_name_follows_upstream() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, v1) = init_repo(dir.path());
        let releases = ReleaseStore::new(dir.path().join("deploy"));
        let fetcher = GitArtifactFetcher::new(
            repo.to_string_lossy(),
            releases.mirror_dir(),
            Duration::from_secs(30),
            1,
        );

        let first = fetcher.validate(&Revision::new("main")).await.unwrap();
        assert_eq!(first.id(), v1);
        releases
            .prepare(&first, &fetcher, None, None, Duration::from_secs(30))
            .await
            .unwrap();

        std::fs::write(repo.join("app.txt"), "v2").unwrap();
        git(&repo, &["commit", "--quiet", "-am", "v2"]);
        let v2 = git(&repo, &["rev-parse", "HEAD"]);

        let second = fetcher.validate(&Revision::new("main")).await.unwrap();
        assert_eq!(second.id(), v2);
        let dir_v2 = releases
            .prepare(&second, &fetcher, None, None, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir_v2.join("app.txt")).unwrap(), "v2");
        assert!(releases.has_release(&first).await);
    }

    #[test]
    fn test_full_hash_detection() {
        assert!(is_full_hash("4f2a9c1e4f2a9c1e4f2a9c1e4f2a9c1e4f2a9c1e"));
        assert!(!is_full_hash("4f2a9c1"));
        assert!(!is_full_hash("main"));
    }

    #[tokio::test]
    async fn test_validate_unknown_revision() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = init_repo(dir.path());
        let fetcher = GitArtifactFetcher::new(
            repo.to_string_lossy(),
            dir.path().join("repo.git"),
            Duration::from_secs(30),
            1,
        );

        let err = fetcher
            .validate(&Revision::new("0000000000000000000000000000000000000000"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::RevisionUnavailable(..)));

        let err = fetcher.validate(&Revision::new("../x")).await.unwrap_err();
        assert!(matches!(err, DeployError::RevisionUnavailable(..)));
    }

    #[tokio::test]
    async fn test_unreachable_repo_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = GitArtifactFetcher::new(
            "/nonexistent/eeveon/upstream",
            dir.path().join("repo.git"),
            Duration::from_secs(10),
            2,
        )
        .with_retry_delay(Duration::from_millis(10));

        let err = fetcher.validate(&Revision::new("abc123")).await.unwrap_err();
        assert!(matches!(err, DeployError::RevisionUnavailable(..)));
    }
}
