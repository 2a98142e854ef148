//! 部署历史存储
//!
//! 保存已结束的部署尝试，超出上限时丢弃最旧的记录；
//! 配置了持久化路径时，每次写入后原子地落盘（tmp + rename）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::env::constants::MAX_ATTEMPT_HISTORY;
use crate::domain::deploy::{DeployAttempt, DeployOutcome};

/// 持久化文件格式
#[derive(Debug, Serialize, Deserialize)]
struct PersistedHistory {
    /// 版本号（用于未来格式升级）
    version: u32,
    saved_at: DateTime<Utc>,
    attempts: Vec<DeployAttempt>,
}

/// 部署历史存储
pub struct AttemptStore {
    /// 最新的在前
    history: RwLock<VecDeque<DeployAttempt>>,
    max_history: usize,
    persist_path: Option<PathBuf>,
}

impl AttemptStore {
    /// 仅内存存储
    pub fn new() -> Self {
        Self::with_config(MAX_ATTEMPT_HISTORY, None)
    }

    pub fn with_config(max_history: usize, persist_path: Option<PathBuf>) -> Self {
        Self {
            history: RwLock::new(VecDeque::new()),
            max_history: max_history.max(1),
            persist_path,
        }
    }

    /// 创建并从持久化文件恢复历史
    pub async fn open(persist_path: PathBuf) -> Self {
        let store = Self::with_config(MAX_ATTEMPT_HISTORY, Some(persist_path));
        store.load().await;
        store
    }

    async fn load(&self) {
        let Some(ref path) = self.persist_path else {
            return;
        };
        if !path.exists() {
            return;
        }

        let content = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read deploy history");
                return;
            }
        };

        match serde_json::from_str::<PersistedHistory>(&content) {
            Ok(persisted) => {
                let mut history = self.history.write().await;
                history.extend(persisted.attempts.into_iter().take(self.max_history));
                info!(
                    path = %path.display(),
                    attempts = history.len(),
                    saved_at = %persisted.saved_at,
                    "Loaded deploy history"
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse deploy history, ignoring");
            }
        }
    }

    async fn save(&self, attempts: Vec<DeployAttempt>) -> anyhow::Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        let temp_path = path.with_extension("json.tmp");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(&PersistedHistory {
            version: 1,
            saved_at: Utc::now(),
            attempts,
        })?;

        fs::write(&temp_path, &content).await?;
        // 原子重命名
        fs::rename(&temp_path, path).await?;
        Ok(())
    }

    /// 记录一个已结束的部署尝试
    pub async fn record(&self, attempt: DeployAttempt) {
        let snapshot = {
            let mut history = self.history.write().await;
            history.retain(|a| a.id != attempt.id);
            history.push_front(attempt);
            while history.len() > self.max_history {
                history.pop_back();
            }
            self.persist_path
                .as_ref()
                .map(|_| history.iter().cloned().collect::<Vec<_>>())
        };

        if let Some(attempts) = snapshot {
            if let Err(e) = self.save(attempts).await {
                warn!(error = %e, "Failed to persist deploy history");
            }
        }
    }

    pub async fn get(&self, attempt_id: &str) -> Option<DeployAttempt> {
        let history = self.history.read().await;
        history.iter().find(|a| a.id == attempt_id).cloned()
    }

    /// 获取历史记录（最新的在前）
    pub async fn list(&self, limit: usize, outcome: Option<DeployOutcome>) -> Vec<DeployAttempt> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|a| outcome.map_or(true, |o| a.outcome == o))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.history.read().await.len()
    }

    /// 最近一次成功部署
    pub async fn last_success(&self) -> Option<DeployAttempt> {
        let history = self.history.read().await;
        history
            .iter()
            .find(|a| a.outcome == DeployOutcome::Success)
            .cloned()
    }
}

impl Default for AttemptStore {
    fn default() -> Self {
        Self::new()
    }
}
