//! 本机执行通道
//!
//! [`ShellExecutor`] 在调度器所在主机上以子进程运行任务命令，适用于
//! 地址为回环地址的本地Worker池。

pub mod executors;


pub use executors::{ShellExecutor, ShellTaskParams};
