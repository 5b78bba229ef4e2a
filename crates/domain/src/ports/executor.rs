use std::time::Duration;

use async_trait::async_trait;
use devpool_errors::SchedulerResult;
use serde::{Deserialize, Serialize};

use crate::models::{Checkpoint, Worker};
use crate::value_objects::{TaskId, TaskPayload};
use crate::views::CommandOutput;

/// 交给执行器的一次执行请求
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    /// 租约序号，与任务的 attempts 一致
    pub attempt: u32,
    pub task_type: String,
    pub payload: TaskPayload,
    pub worker: Worker,
    /// 从检查点恢复时携带最新检查点
    pub checkpoint: Option<Checkpoint>,
    pub timeout: Duration,
}

/// 执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
    Completed { output: TaskPayload },
    /// 任务交出阶段性进度，调度器保存检查点后在同一Worker上继续执行
    Yielded { progress: TaskPayload },
}

/// 远程执行通道
///
/// 调度器只依赖“在Worker W上执行并返回结果或错误”这一能力，传输细节由实现方负责。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome>;

    /// 主动探测Worker是否可达
    async fn probe(&self, worker: &Worker) -> SchedulerResult<()>;

    async fn run_command(&self, worker: &Worker, command: &str) -> SchedulerResult<CommandOutput>;

    /// 尽力取消正在执行的任务，返回执行端是否确认
    async fn cancel(&self, worker: &Worker, task_id: TaskId) -> SchedulerResult<bool>;

    fn name(&self) -> &str;
}
