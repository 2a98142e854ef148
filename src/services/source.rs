//! 版本源
//!
//! 抽象的「查询最新可部署版本」能力，不依赖任何托管平台 API：
//! - `GitRemoteSource`：`git ls-remote`
//! - `HttpManifestSource`：HTTP JSON manifest

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::DeployError;
use crate::infra::command::{CommandError, CommandRunner};

/// 版本源
#[async_trait]
pub trait RevisionSource: Send + Sync {
    /// 查询最新版本标识，失败返回 `SourceUnreachable`
    async fn latest(&self) -> Result<String, DeployError>;

    /// 用于日志的描述
    fn describe(&self) -> String;
}

/// 基于 `git ls-remote` 的版本源
pub struct GitRemoteSource {
    repo_url: String,
    branch: String,
    timeout: Duration,
}

impl GitRemoteSource {
    pub fn new(repo_url: impl Into<String>, branch: impl Into<String>, timeout: Duration) -> Self {
        Self {
            repo_url: repo_url.into(),
            branch: branch.into(),
            timeout,
        }
    }

    fn ref_name(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }
}

/// 从 ls-remote 输出中取出指定 ref 的 commit hash
pub(crate) fn parse_ls_remote(output: &str, ref_name: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        let hash = parts.next()?;
        let name = parts.next()?;
        (name == ref_name).then(|| hash.to_string())
    })
}

#[async_trait]
impl RevisionSource for GitRemoteSource {
    async fn latest(&self) -> Result<String, DeployError> {
        let ref_name = self.ref_name();
        let output = CommandRunner::run_simple(
            "git",
            &["ls-remote", &self.repo_url, &ref_name],
            &std::env::temp_dir(),
            self.timeout,
        )
        .await
        .map_err(|e| match e {
            CommandError::Timeout(t) => {
                DeployError::SourceUnreachable(format!("git ls-remote timed out after {:?}", t))
            }
            other => DeployError::SourceUnreachable(other.to_string()),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::SourceUnreachable(format!(
                "git ls-remote failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ls_remote(&stdout, &ref_name).ok_or_else(|| {
            DeployError::SourceUnreachable(format!("branch {} not found", self.branch))
        })
    }

    fn describe(&self) -> String {
        format!("git {}#{}", self.repo_url, self.branch)
    }
}

/// HTTP manifest 内容
#[derive(Debug, Clone, Deserialize)]
pub struct RevisionManifest {
    pub revision: String,
    pub released_at: Option<String>,
    pub notes: Option<String>,
}

/// 基于 HTTP JSON manifest 的版本源
pub struct HttpManifestSource {
    url: String,
    http: reqwest::Client,
}

impl HttpManifestSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to build reqwest client");
        Self {
            url: url.into(),
            http,
        }
    }

    pub async fn fetch_manifest(&self) -> Result<RevisionManifest, DeployError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| DeployError::SourceUnreachable(format!("manifest request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DeployError::SourceUnreachable(format!(
                "manifest returned {}",
                response.status()
            )));
        }

        response
            .json::<RevisionManifest>()
            .await
            .map_err(|e| DeployError::SourceUnreachable(format!("invalid manifest: {}", e)))
    }
}

#[async_trait]
impl RevisionSource for HttpManifestSource {
    async fn latest(&self) -> Result<String, DeployError> {
        let manifest = self.fetch_manifest().await?;
        let revision = manifest.revision.trim();
        if revision.is_empty() {
            return Err(DeployError::SourceUnreachable(
                "manifest has an empty revision".to_string(),
            ));
        }
        Ok(revision.to_string())
    }

    fn describe(&self) -> String {
        format!("manifest {}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};

    #[test]
    fn test_parse_ls_remote() {
        let output = "\
1111111111111111111111111111111111111111\trefs/heads/main-old
2222222222222222222222222222222222222222\trefs/heads/main
";
        assert_eq!(
            parse_ls_remote(output, "refs/heads/main").as_deref(),
            Some("2222222222222222222222222222222222222222")
        );
        assert_eq!(parse_ls_remote(output, "refs/heads/dev"), None);
        assert_eq!(parse_ls_remote("", "refs/heads/main"), None);
    }

    #[tokio::test]
    async fn test_git_source_unreachable() {
        let source = GitRemoteSource::new(
            "/nonexistent/eeveon/repo.git",
            "main",
            Duration::from_secs(10),
        );
        let err = source.latest().await.unwrap_err();
        assert!(matches!(err, DeployError::SourceUnreachable(_)));
        assert!(err.is_retryable());
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_http_manifest_source() {
        let base = serve(Router::new().route(
            "/latest.json",
            get(|| async { Json(serde_json::json!({ "revision": "v1.4.2", "notes": "fix" })) }),
        ))
        .await;

        let source = HttpManifestSource::new(format!("{}/latest.json", base), Duration::from_secs(5));
        assert_eq!(source.latest().await.unwrap(), "v1.4.2");

        let missing = HttpManifestSource::new(format!("{}/nope.json", base), Duration::from_secs(5));
        assert!(matches!(
            missing.latest().await,
            Err(DeployError::SourceUnreachable(_))
        ));
    }
}
