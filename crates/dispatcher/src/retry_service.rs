use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devpool_domain::{TaskId, TaskNotifier, TaskStatus, TaskView, WorkerId};
use devpool_errors::{SchedulerError, SchedulerResult};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dependency_resolver::DependencyResolver;
use crate::in_flight::InFlightTracker;
use crate::priority_queue::{QueueEntry, TaskQueue};
use crate::registry::WorkerRegistry;
use crate::task_store::TaskStore;

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 基础重试间隔
    pub base_interval: Duration,
    /// 最大重试间隔
    pub max_interval: Duration,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&devpool_core::RetryConfig> for RetryConfig {
    fn from(config: &devpool_core::RetryConfig) -> Self {
        Self {
            base_interval: Duration::from_millis(config.base_delay_ms),
            max_interval: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }
}

/// 一次失败处理的结果
#[derive(Debug, Clone, PartialEq)]
pub enum FailureDisposition {
    /// 进入 Retrying，到期后重新入队
    Retrying {
        retry_count: u32,
        not_before: DateTime<Utc>,
    },
    /// 终止为 Failed
    Failed { reason: String },
    /// 租约已失效，结果被忽略
    Stale,
}

/// Worker失效时回收的任务
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimReport {
    pub requeued: Vec<TaskId>,
    pub failed: Vec<TaskId>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }
}

/// 重试服务接口
#[async_trait]
pub trait RetryService: Send + Sync {
    /// 处理执行失败（包括超时），决定重试还是终止
    async fn handle_failed_task(
        &self,
        task_id: TaskId,
        attempt: u32,
        error: &SchedulerError,
    ) -> SchedulerResult<FailureDisposition>;

    /// 回收失效Worker上的全部在途任务
    async fn handle_worker_failure(&self, worker_id: &WorkerId) -> SchedulerResult<ReclaimReport>;

    /// 将到期的 Retrying 任务重新入队
    async fn scan_retry_tasks(&self) -> SchedulerResult<Vec<TaskId>>;

    /// 计算第 `retry_count` 次重试前的等待时间
    fn calculate_backoff(&self, retry_count: u32) -> Duration;
}

/// 重试服务实现
pub struct TaskRetryService {
    store: Arc<TaskStore>,
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
    resolver: Arc<DependencyResolver>,
    notifier: Arc<dyn TaskNotifier>,
    in_flight: Arc<InFlightTracker>,
    wake: Arc<Notify>,
    retry_config: RetryConfig,
}

impl TaskRetryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        queue: Arc<TaskQueue>,
        registry: Arc<WorkerRegistry>,
        resolver: Arc<DependencyResolver>,
        notifier: Arc<dyn TaskNotifier>,
        in_flight: Arc<InFlightTracker>,
        wake: Arc<Notify>,
        retry_config: Option<RetryConfig>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            resolver,
            notifier,
            in_flight,
            wake,
            retry_config: retry_config.unwrap_or_default(),
        }
    }

    /// 任务终止后通知并让等待它的下游任务失败
    async fn finalize_failure(&self, view: &TaskView, reason: &str) {
        self.notifier.task_failed(view, reason).await;
        if let Err(e) = self.resolver.propagate_failure(view.id).await {
            error!("传播任务 {} 的失败到下游时出错: {}", view.id, e);
        }
    }
}

#[async_trait]
impl RetryService for TaskRetryService {
    async fn handle_failed_task(
        &self,
        task_id: TaskId,
        attempt: u32,
        error: &SchedulerError,
    ) -> SchedulerResult<FailureDisposition> {
        debug!("处理任务 {} 第 {} 次执行的失败: {}", task_id, attempt, error);

        let (disposition, worker, failed_view) = {
            let mut table = self.store.write().await;
            let task = table
                .get(&task_id)
                .ok_or_else(|| SchedulerError::task_not_found(task_id))?;

            if !task.status.is_in_flight() || task.attempts != attempt {
                debug!(
                    "任务 {} 的租约已失效 (当前状态 {}, 租约 {})，忽略第 {} 次执行的失败",
                    task_id, task.status, task.attempts, attempt
                );
                return Ok(FailureDisposition::Stale);
            }

            let worker = task.assigned_worker.clone();
            if error.counts_against_retry_budget() && task.has_retry_budget() {
                let delay = self.calculate_backoff(task.retry_count);
                let not_before = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let disposition = table.update(&task_id, |t| {
                    t.retry_count += 1;
                    t.last_error = Some(error.to_string());
                    t.assigned_worker = None;
                    t.retry_not_before = Some(not_before);
                    t.transition_to(TaskStatus::Retrying, Some(error.to_string()))?;
                    Ok(FailureDisposition::Retrying {
                        retry_count: t.retry_count,
                        not_before,
                    })
                })?;
                (disposition, worker, None)
            } else {
                let reason = if error.is_retryable() {
                    SchedulerError::RetryExhausted {
                        task: task_id.to_string(),
                        attempts: task.attempts,
                        last_error: error.to_string(),
                    }
                    .to_string()
                } else {
                    error.to_string()
                };
                let view = table.update(&task_id, |t| {
                    t.last_error = Some(reason.clone());
                    t.assigned_worker = None;
                    t.retry_not_before = None;
                    t.transition_to(TaskStatus::Failed, Some(reason.clone()))?;
                    Ok(TaskView::from(&*t))
                })?;
                (FailureDisposition::Failed { reason }, worker, Some(view))
            }
        };

        if let Some(worker) = &worker {
            self.registry.release(worker).await;
        }
        self.wake.notify_one();

        match &disposition {
            FailureDisposition::Retrying {
                retry_count,
                not_before,
            } => {
                metrics::counter!("devpool_tasks_retried_total").increment(1);
                info!(
                    "任务 {} 将进行第 {} 次重试，最早执行时间: {}",
                    task_id,
                    retry_count,
                    not_before.format("%Y-%m-%d %H:%M:%S%.3f UTC")
                );
            }
            FailureDisposition::Failed { reason } => {
                metrics::counter!("devpool_tasks_failed_total", "reason" => "execution")
                    .increment(1);
                warn!("任务 {} 最终失败: {}", task_id, reason);
                if let Some(view) = &failed_view {
                    self.finalize_failure(view, reason).await;
                }
            }
            FailureDisposition::Stale => {}
        }

        Ok(disposition)
    }

    async fn handle_worker_failure(&self, worker_id: &WorkerId) -> SchedulerResult<ReclaimReport> {
        info!("开始回收失效Worker {} 上的任务", worker_id);

        let mut report = ReclaimReport::default();
        let mut leases = Vec::new();
        let mut failed_views = Vec::new();
        {
            let mut table = self.store.write().await;
            for task_id in table.in_flight_on(worker_id) {
                let Some(task) = table.get(&task_id) else {
                    continue;
                };
                let attempt = task.attempts;
                let reason = format!("Worker {worker_id} 不可达，任务被回收");

                if task.has_retry_budget() {
                    let entry = table.update(&task_id, |t| {
                        t.retry_count += 1;
                        t.last_error = Some(reason.clone());
                        t.assigned_worker = None;
                        t.retry_not_before = None;
                        t.transition_to(TaskStatus::Retrying, Some(reason.clone()))?;
                        t.transition_to(TaskStatus::Queued, Some("回收后重新入队".to_string()))?;
                        Ok(QueueEntry::from(&*t))
                    })?;
                    self.queue.push_admitted(entry).await;
                    report.requeued.push(task_id);
                } else {
                    let failure = SchedulerError::RetryExhausted {
                        task: task_id.to_string(),
                        attempts: task.attempts,
                        last_error: reason,
                    }
                    .to_string();
                    let view = table.update(&task_id, |t| {
                        t.last_error = Some(failure.clone());
                        t.assigned_worker = None;
                        t.transition_to(TaskStatus::Failed, Some(failure.clone()))?;
                        Ok(TaskView::from(&*t))
                    })?;
                    failed_views.push((view, failure));
                    report.failed.push(task_id);
                }
                leases.push((task_id, attempt));
            }
        }

        for (task_id, attempt) in &leases {
            self.registry.release(worker_id).await;
            self.in_flight.abort(*task_id, *attempt).await;
        }

        if !report.is_empty() {
            metrics::counter!("devpool_tasks_reclaimed_total").increment(report.total() as u64);
            self.wake.notify_one();
        }
        for (view, reason) in &failed_views {
            metrics::counter!("devpool_tasks_failed_total", "reason" => "reclaim").increment(1);
            self.finalize_failure(view, reason).await;
        }

        info!(
            "完成失效Worker {} 的任务回收: 重新入队 {} 个，失败 {} 个",
            worker_id,
            report.requeued.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn scan_retry_tasks(&self) -> SchedulerResult<Vec<TaskId>> {
        let now = Utc::now();
        let mut promoted = Vec::new();
        {
            let mut table = self.store.write().await;
            for task_id in table.ids_with_status(TaskStatus::Retrying) {
                let due = table
                    .get(&task_id)
                    .is_some_and(|t| t.retry_not_before.map_or(true, |at| at <= now));
                if !due {
                    continue;
                }
                let entry = table.update(&task_id, |t| {
                    t.retry_not_before = None;
                    t.transition_to(TaskStatus::Queued, Some("重试时间已到".to_string()))?;
                    Ok(QueueEntry::from(&*t))
                })?;
                self.queue.push_admitted(entry).await;
                promoted.push(task_id);
            }
        }

        if !promoted.is_empty() {
            debug!("{} 个重试任务重新入队", promoted.len());
        }
        Ok(promoted)
    }

    fn calculate_backoff(&self, retry_count: u32) -> Duration {
        let base_interval = self.retry_config.base_interval.as_secs_f64();
        let max_interval = self.retry_config.max_interval.as_secs_f64();
        let multiplier = self.retry_config.backoff_multiplier;
        let jitter_factor = self.retry_config.jitter_factor;

        let exponential_interval =
            base_interval * multiplier.powi(retry_count.min(i32::MAX as u32) as i32);
        let capped_interval = exponential_interval.min(max_interval);

        // 随机抖动避免大量任务同时重试
        let jitter = capped_interval * jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).max(base_interval);

        Duration::from_secs_f64(final_interval)
    }
}
