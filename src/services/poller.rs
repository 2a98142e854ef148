//! 版本轮询
//!
//! 定期查询版本源，发现新版本后交给协调器部署。
//! - 检查互不重叠：进行中时新的检查直接跳过
//! - 失败后按指数退避（有上限）等待，成功后重置
//! - 部署进行中发现的新版本不排队，下一轮重新发现

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PollConfig;
use crate::domain::{DeployTrigger, Revision};
use crate::error::DeployError;
use crate::services::backoff::Backoff;
use crate::services::coordinator::DeployCoordinator;
use crate::services::source::RevisionSource;

/// 版本轮询器
pub struct Poller {
    source: Arc<dyn RevisionSource>,
    config: PollConfig,
    /// 最近一次观察到的上游版本
    last_known: RwLock<Option<Revision>>,
    /// 检查互斥
    checking: Mutex<()>,
}

impl Poller {
    pub fn new(source: Arc<dyn RevisionSource>, config: PollConfig) -> Self {
        Self {
            source,
            config,
            last_known: RwLock::new(None),
            checking: Mutex::new(()),
        }
    }

    pub fn source(&self) -> &dyn RevisionSource {
        self.source.as_ref()
    }

    /// 以已安装版本作为起点，重启后不会重复部署
    pub async fn seed(&self, installed: Option<Revision>) {
        *self.last_known.write().await = installed;
    }

    pub async fn last_known(&self) -> Option<Revision> {
        self.last_known.read().await.clone()
    }

    /// 查询上游最新版本，不影响 `last_known`
    pub async fn latest_upstream(&self) -> Result<Revision, DeployError> {
        let latest = tokio::time::timeout(self.config.check_timeout, self.source.latest())
            .await
            .map_err(|_| {
                DeployError::SourceUnreachable(format!(
                    "{} did not answer within {:?}",
                    self.source.describe(),
                    self.config.check_timeout
                ))
            })??;
        let revision = Revision::new(latest);
        if !revision.is_path_safe() {
            return Err(DeployError::RevisionUnavailable(
                revision.id().to_string(),
                format!("{} reported an invalid revision identifier", self.source.describe()),
            ));
        }
        Ok(revision)
    }

    /// 上游版本是否不同于 `last_known`，不记住结果
    ///
    /// 手动检查使用，不会让轮询循环错过这个版本
    pub async fn peek_update(&self) -> Result<Option<Revision>, DeployError> {
        let latest = self.latest_upstream().await?;
        if self.last_known.read().await.as_ref() == Some(&latest) {
            return Ok(None);
        }
        Ok(Some(latest))
    }

    /// 检查是否有新版本
    ///
    /// 与上次观察到的版本不同时返回新版本并记住它；另一检查进行中时返回 `None`
    pub async fn check_for_update(&self) -> Result<Option<Revision>, DeployError> {
        let Ok(_checking) = self.checking.try_lock() else {
            debug!("Revision check already in flight, skipping");
            return Ok(None);
        };

        let latest = self.latest_upstream().await?;

        let mut last_known = self.last_known.write().await;
        if last_known.as_ref() == Some(&latest) {
            debug!(revision = %latest, "No upstream change");
            return Ok(None);
        }

        info!(
            revision = %latest,
            previous = ?last_known.as_ref().map(|r| r.short()),
            source = %self.source.describe(),
            "New revision detected"
        );
        *last_known = Some(latest.clone());
        Ok(Some(latest))
    }

    /// 放弃一个因部署进行中而未能部署的版本，下一轮重新发现
    pub async fn defer(&self, revision: &Revision) {
        let mut last_known = self.last_known.write().await;
        if last_known.as_ref() == Some(revision) {
            *last_known = None;
            info!(revision = %revision, "Deploy in progress, revision deferred to next poll");
        }
    }

    /// 轮询循环，直到 `cancel` 触发
    pub async fn run(self: Arc<Self>, coordinator: Arc<DeployCoordinator>, cancel: CancellationToken) {
        info!(
            source = %self.source.describe(),
            interval_secs = self.config.interval.as_secs(),
            "Poller started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.check_for_update().await {
                Ok(Some(revision)) => {
                    backoff.reset();
                    self.dispatch(revision, &coordinator).await;
                }
                Ok(None) => backoff.reset(),
                // 重试无法修复，按正常间隔继续
                Err(e) if !e.is_retryable() => {
                    backoff.reset();
                    error!(error = %e, "Revision check rejected");
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in_secs = delay.as_secs(), "Revision check failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    // 退避结束后立即检查
                    ticker.reset_immediately();
                }
            }
        }

        info!("Poller stopped");
    }

    /// 把新版本交给协调器，在独立任务中执行
    async fn dispatch(&self, revision: Revision, coordinator: &Arc<DeployCoordinator>) {
        if coordinator.current_revision().await.as_ref() == Some(&revision) {
            debug!(revision = %revision, "Revision already deployed");
            return;
        }

        match coordinator.begin(revision.clone(), DeployTrigger::Poller).await {
            Ok(ticket) => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.execute(ticket).await;
                });
            }
            Err(DeployError::AlreadyDeploying { .. }) => self.defer(&revision).await,
            Err(e) => warn!(revision = %revision, error = %e, "Failed to start deploy"),
        }
    }
}
