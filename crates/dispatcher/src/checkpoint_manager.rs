use std::sync::Arc;

use devpool_domain::{Checkpoint, CheckpointStore, TaskId, TaskPayload, WorkerId};
use devpool_errors::{SchedulerError, SchedulerResult};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::task_store::TaskStore;

/// 检查点管理
///
/// 序号以检查点存储为准，文件存储在调度器重启后仍能接着编号。
pub struct CheckpointManager {
    store: Arc<TaskStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    save_lock: Mutex<()>,
}

impl CheckpointManager {
    pub fn new(store: Arc<TaskStore>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            checkpoints,
            save_lock: Mutex::new(()),
        }
    }

    /// 追加检查点并在任务上记录最新序号
    pub async fn save(&self, task_id: TaskId, payload: TaskPayload) -> SchedulerResult<Checkpoint> {
        let _guard = self.save_lock.lock().await;

        let task = self.store.get(&task_id).await?;
        if task.is_terminal() {
            return Err(SchedulerError::validation_error(format!(
                "任务 {} 已处于终止状态 {}，不能保存检查点",
                task_id, task.status
            )));
        }

        self.append_next(task_id, payload).await
    }

    /// 执行端汇报的进度，只在该次执行仍持有租约时保存，租约失效时返回 None
    pub async fn save_for_attempt(
        &self,
        task_id: TaskId,
        attempt: u32,
        worker: &WorkerId,
        payload: TaskPayload,
    ) -> SchedulerResult<Option<Checkpoint>> {
        let _guard = self.save_lock.lock().await;

        let task = self.store.get(&task_id).await?;
        if !task.holds_lease(attempt, worker) {
            debug!(
                "任务 {} 第 {} 次执行的租约已失效，丢弃来自Worker {} 的进度",
                task_id, attempt, worker
            );
            return Ok(None);
        }

        self.append_next(task_id, payload).await.map(Some)
    }

    async fn append_next(&self, task_id: TaskId, payload: TaskPayload) -> SchedulerResult<Checkpoint> {
        let sequence = self
            .checkpoints
            .latest(task_id)
            .await?
            .map_or(1, |c| c.sequence + 1);
        let checkpoint = Checkpoint::new(task_id, sequence, payload);
        self.checkpoints.append(checkpoint.clone()).await?;

        self.store
            .update(&task_id, |t| {
                t.checkpoint_seq = Some(sequence);
                Ok(())
            })
            .await?;

        metrics::counter!("devpool_checkpoints_saved_total").increment(1);
        debug!("任务 {} 保存检查点 #{}", task_id, sequence);
        Ok(checkpoint)
    }

    /// 最新检查点，不存在时返回 `NoCheckpoint`
    pub async fn latest(&self, task_id: TaskId) -> SchedulerResult<Checkpoint> {
        self.store.get(&task_id).await?;
        self.checkpoints
            .latest(task_id)
            .await?
            .ok_or_else(|| SchedulerError::no_checkpoint(task_id))
    }

    pub async fn list(&self, task_id: TaskId) -> SchedulerResult<Vec<Checkpoint>> {
        self.store.get(&task_id).await?;
        self.checkpoints.list(task_id).await
    }

    /// 执行前查询恢复点，读取失败时从头开始执行
    pub async fn resume_point(&self, task_id: TaskId) -> Option<Checkpoint> {
        match self.checkpoints.latest(task_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("读取任务 {} 的检查点失败，将从头执行: {}", task_id, e);
                None
            }
        }
    }
}
