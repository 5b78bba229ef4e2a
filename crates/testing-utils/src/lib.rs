//! # Devpool Testing Utils
//!
//! 调度器各crate共享的测试工具：
//!
//! - **Builders**: 以合理默认值构造 `TaskSpec` 和 `Worker`
//! - **Mocks**: 可编排执行结果的 `MockExecutor`，记录失败通知的 `RecordingNotifier`
//!
//! ```toml
//! [dev-dependencies]
//! devpool-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
