use async_trait::async_trait;

use crate::views::TaskView;

/// 任务最终失败时的通知出口
#[async_trait]
pub trait TaskNotifier: Send + Sync {
    async fn task_failed(&self, task: &TaskView, reason: &str);
}
