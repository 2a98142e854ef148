//! 版本（Revision）领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 可部署的版本
///
/// 不可变：创建后只能整体替换
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Revision {
    /// 版本标识（commit hash 或 manifest 版本号）
    id: String,
    /// 发现时间
    discovered_at: DateTime<Utc>,
}

impl Revision {
    /// 以当前时间作为发现时间创建版本
    pub fn new(id: impl Into<String>) -> Self {
        Self::discovered_at(id, Utc::now())
    }

    /// 指定发现时间创建版本
    pub fn discovered_at(id: impl Into<String>, discovered_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            discovered_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn discovered(&self) -> DateTime<Utc> {
        self.discovered_at
    }

    /// 用于展示的短标识（前 12 个字符）
    pub fn short(&self) -> &str {
        match self.id.char_indices().nth(12) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }

    /// 标识是否可以安全地用作目录名
    pub fn is_path_safe(&self) -> bool {
        !self.id.is_empty()
            && self.id != "."
            && self.id != ".."
            && !self.id.starts_with('.')
            && self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }

    /// 两个版本是否指向同一标识（忽略发现时间）
    pub fn same_as(&self, other: &Revision) -> bool {
        self.id == other.id
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Revision {}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}
