//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod deploy;
pub mod revision;
pub mod service;

// Re-exports for convenience
pub use deploy::{
    DeployAttempt, DeployOutcome, DeployPhase, DeployTrigger, IllegalTransition, LogLine,
    PhaseTransition,
};
pub use revision::Revision;
pub use service::{HealthStatus, ServiceState, StopOutcome};
