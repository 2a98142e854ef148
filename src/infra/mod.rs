//! 基础设施模块
//!
//! 封装外部依赖（HTTP client、命令执行等）

pub mod command;
pub mod reporter;

pub use command::{CommandError, CommandRunner};
pub use reporter::AttemptReporter;
