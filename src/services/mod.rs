//! 服务层模块
//!
//! 轮询、部署协调与进程管理

pub mod backoff;
pub mod coordinator;
pub mod fetcher;
pub mod poller;
pub mod release;
pub mod source;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{CoordinatorStatus, DeployCoordinator, DeployTicket};
pub use poller::Poller;
pub use supervisor::{ProcessSupervisor, ServiceControl};
