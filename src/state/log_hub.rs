//! 日志通道管理
//!
//! 每个部署尝试一个广播通道，供 SSE 订阅；尝试结束后关闭并清理

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

use crate::domain::deploy::LogLine;

/// 日志通道容量
const LOG_CHANNEL_CAPACITY: usize = 256;

/// 日志通道信息
struct LogChannel {
    /// 广播发送者，结束后置为 None，使订阅者收到 Closed
    sender: Option<broadcast::Sender<LogLine>>,
    created_at: DateTime<Utc>,
}

/// 日志中心
pub struct LogHub {
    /// 通道映射 (attempt_id -> LogChannel)
    channels: RwLock<HashMap<String, LogChannel>>,
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// 创建新的日志通道
    ///
    /// 如果通道已存在且未结束，返回现有的发送者
    pub async fn create(&self, attempt_id: &str) -> broadcast::Sender<LogLine> {
        let mut channels = self.channels.write().await;

        if let Some(sender) = channels.get(attempt_id).and_then(|c| c.sender.clone()) {
            return sender;
        }

        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        channels.insert(
            attempt_id.to_string(),
            LogChannel {
                sender: Some(sender.clone()),
                created_at: Utc::now(),
            },
        );

        sender
    }

    /// 订阅日志通道
    ///
    /// 通道不存在或已结束时返回 None
    pub async fn subscribe(&self, attempt_id: &str) -> Option<broadcast::Receiver<LogLine>> {
        let channels = self.channels.read().await;
        channels
            .get(attempt_id)
            .and_then(|c| c.sender.as_ref())
            .map(|s| s.subscribe())
    }

    /// 标记通道结束
    ///
    /// 丢弃 hub 持有的发送者；其他发送者全部释放后订阅者收到 Closed
    pub async fn finish(&self, attempt_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(attempt_id) {
            channel.sender = None;
        }
    }

    pub async fn is_finished(&self, attempt_id: &str) -> bool {
        let channels = self.channels.read().await;
        channels.get(attempt_id).map_or(true, |c| c.sender.is_none())
    }

    pub async fn exists(&self, attempt_id: &str) -> bool {
        self.channels.read().await.contains_key(attempt_id)
    }

    /// 清理超过指定时长的已结束通道
    pub async fn cleanup_expired(&self, max_age: chrono::Duration) {
        let now = Utc::now();
        let mut channels = self.channels.write().await;
        channels.retain(|_, channel| channel.sender.is_some() || now - channel.created_at < max_age);
    }

    /// 获取活跃通道数量（未结束）
    pub async fn active_count(&self) -> usize {
        let channels = self.channels.read().await;
        channels.values().filter(|c| c.sender.is_some()).count()
    }
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}
