//! 任务调度与Worker编排引擎
//!
//! [`Scheduler`] 是对外入口，内部组件按依赖顺序为：Worker注册表、任务存储、
//! 依赖解析、优先级队列、健康监控、检查点管理、重试服务和派发器。

pub mod checkpoint_manager;
pub mod config;
pub mod controller;
pub mod dependency_resolver;
pub mod dispatcher;
pub mod health_monitor;
pub mod in_flight;
pub mod priority_queue;
pub mod registry;
pub mod retry_service;
pub mod scheduler;
pub mod task_store;

#[cfg(test)]
pub mod test_utils;

pub use config::SchedulerConfig;
pub use health_monitor::{HealthMonitorConfig, HealthMonitorService, SweepReport};
pub use retry_service::{FailureDisposition, ReclaimReport, RetryConfig, RetryService};
pub use scheduler::Scheduler;
