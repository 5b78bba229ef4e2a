use std::sync::Arc;
use std::time::Duration;

use devpool_domain::{Task, TaskExecutor, TaskId, TaskStatus, TaskView};
use devpool_errors::{SchedulerError, SchedulerResult};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::dependency_resolver::DependencyResolver;
use crate::in_flight::InFlightTracker;
use crate::priority_queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::retry_service::{FailureDisposition, RetryService};
use crate::task_store::TaskStore;

/// 任务控制（取消）
pub struct TaskController {
    store: Arc<TaskStore>,
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
    resolver: Arc<DependencyResolver>,
    retry_service: Arc<dyn RetryService>,
    executor: Arc<dyn TaskExecutor>,
    in_flight: Arc<InFlightTracker>,
    wake: Arc<Notify>,
    cancel_grace: Duration,
}

impl TaskController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        queue: Arc<TaskQueue>,
        registry: Arc<WorkerRegistry>,
        resolver: Arc<DependencyResolver>,
        retry_service: Arc<dyn RetryService>,
        executor: Arc<dyn TaskExecutor>,
        in_flight: Arc<InFlightTracker>,
        wake: Arc<Notify>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            resolver,
            retry_service,
            executor,
            in_flight,
            wake,
            cancel_grace,
        }
    }

    /// 取消任务
    ///
    /// 尚未执行的任务直接取消；执行中的任务先请求执行端取消，
    /// 未在宽限期内得到确认时按一次执行失败处理。
    pub async fn cancel_task(&self, task_id: TaskId) -> SchedulerResult<TaskView> {
        let task = self.store.get(&task_id).await?;

        match task.status {
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying => {
                self.cancel_waiting(task_id).await
            }
            TaskStatus::Running | TaskStatus::Checkpointed => self.cancel_running(task).await,
            status => Err(SchedulerError::InvalidStateTransition {
                task: task_id.to_string(),
                from: status.to_string(),
                to: TaskStatus::Cancelled.to_string(),
            }),
        }
    }

    async fn cancel_waiting(&self, task_id: TaskId) -> SchedulerResult<TaskView> {
        let view = self
            .store
            .update(&task_id, |t| {
                t.retry_not_before = None;
                t.transition_to(TaskStatus::Cancelled, Some("用户取消".to_string()))?;
                Ok(TaskView::from(&*t))
            })
            .await?;

        if self.queue.remove(&task_id).await {
            debug!("任务 {} 已从队列中移除", task_id);
        }
        info!("任务 {} 已取消", task_id);

        self.resolver.propagate_failure(task_id).await?;
        Ok(view)
    }

    async fn cancel_running(&self, task: Task) -> SchedulerResult<TaskView> {
        let task_id = task.id;
        let attempt = task.attempts;
        let worker_id = task.assigned_worker.clone().ok_or_else(|| {
            SchedulerError::Internal(format!("执行中的任务 {task_id} 没有分配Worker"))
        })?;

        let acknowledged = match self.registry.get(&worker_id).await {
            Ok(worker) => {
                match tokio::time::timeout(
                    self.cancel_grace,
                    self.executor.cancel(&worker, task_id),
                )
                .await
                {
                    Ok(Ok(ack)) => ack,
                    Ok(Err(e)) => {
                        warn!("请求Worker {} 取消任务 {} 失败: {}", worker_id, task_id, e);
                        false
                    }
                    Err(_) => {
                        warn!(
                            "Worker {} 未在 {:?} 内响应任务 {} 的取消请求",
                            worker_id, self.cancel_grace, task_id
                        );
                        false
                    }
                }
            }
            Err(e) => {
                warn!("取消任务 {} 时找不到Worker {}: {}", task_id, worker_id, e);
                false
            }
        };

        if !acknowledged {
            let error = SchedulerError::execution(format!("取消任务 {task_id} 未被执行端确认"));
            let disposition = self
                .retry_service
                .handle_failed_task(task_id, attempt, &error)
                .await?;
            if disposition != FailureDisposition::Stale {
                self.in_flight.abort(task_id, attempt).await;
            }
            return Ok(TaskView::from(&self.store.get(&task_id).await?));
        }

        let view = self
            .store
            .update(&task_id, |t| {
                if !t.holds_lease(attempt, &worker_id) {
                    return Err(SchedulerError::InvalidStateTransition {
                        task: task_id.to_string(),
                        from: t.status.to_string(),
                        to: TaskStatus::Cancelled.to_string(),
                    });
                }
                t.assigned_worker = None;
                t.transition_to(
                    TaskStatus::Cancelled,
                    Some("用户取消，执行端已确认".to_string()),
                )?;
                Ok(TaskView::from(&*t))
            })
            .await?;

        self.registry.release(&worker_id).await;
        self.in_flight.abort(task_id, attempt).await;
        self.wake.notify_one();
        info!("执行中的任务 {} 已在Worker {} 上取消", task_id, worker_id);

        self.resolver.propagate_failure(task_id).await?;
        Ok(view)
    }
}
