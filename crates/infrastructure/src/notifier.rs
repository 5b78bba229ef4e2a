use async_trait::async_trait;
use devpool_domain::{TaskNotifier, TaskView};
use tracing::error;

/// 仅记录日志的失败通知，实际的通知渠道由外部组件提供
#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

impl LoggingNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskNotifier for LoggingNotifier {
    async fn task_failed(&self, task: &TaskView, reason: &str) {
        metrics::counter!("devpool_failure_notifications_total").increment(1);
        error!(
            task_id = %task.id,
            task_type = %task.task_type,
            retry_count = task.retry_count,
            "任务最终失败: {}",
            reason
        );
    }
}
