//! 运行时状态模块
//!
//! 管理应用状态、部署历史和日志通道

pub mod app_state;
pub mod attempt_store;
pub mod log_hub;

pub use app_state::AppState;
pub use attempt_store::AttemptStore;
pub use log_hub::LogHub;
