//! 配置模块
//!
//! 环境变量解析与配置管理

pub mod deploy;
pub mod env;
pub mod service;
pub mod source;

pub use deploy::DeployConfig;
pub use env::EnvConfig;
pub use service::{HealthProbe, ServiceConfig};
pub use source::{PollConfig, SourceConfig};
