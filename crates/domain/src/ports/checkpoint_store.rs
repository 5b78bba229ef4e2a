use async_trait::async_trait;
use devpool_errors::SchedulerResult;

use crate::models::Checkpoint;
use crate::value_objects::TaskId;

/// 检查点持久化
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 追加检查点，序号由调用方分配
    async fn append(&self, checkpoint: Checkpoint) -> SchedulerResult<()>;

    async fn latest(&self, task_id: TaskId) -> SchedulerResult<Option<Checkpoint>>;

    /// 按序号升序返回
    async fn list(&self, task_id: TaskId) -> SchedulerResult<Vec<Checkpoint>>;
}
