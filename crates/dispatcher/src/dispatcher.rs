use std::sync::Arc;
use std::time::{Duration, Instant};

use devpool_domain::{
    ExecutionOutcome, ExecutionRequest, Task, TaskExecutor, TaskId, TaskPayload, TaskStatus,
    Worker, WorkerStatus,
};
use devpool_errors::{SchedulerError, SchedulerResult};
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::checkpoint_manager::CheckpointManager;
use crate::dependency_resolver::DependencyResolver;
use crate::in_flight::InFlightTracker;
use crate::priority_queue::{QueueEntry, TaskQueue};
use crate::registry::WorkerRegistry;
use crate::retry_service::RetryService;
use crate::task_store::TaskStore;

/// 单个队列条目的派发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignOutcome {
    Dispatched,
    /// 暂时没有满足能力和资源要求的Worker，条目留到本轮结束后放回
    NoCapableWorker,
    /// 任务已不在 Queued 状态（例如已被取消），条目直接丢弃
    Skipped,
}

/// 任务派发器
///
/// 派发循环每轮先把到期的重试任务放回队列，然后在全局并发上限内不断取出
/// 分数最高的任务，选择负载最低的可用Worker并启动执行。
pub struct TaskDispatcher {
    store: Arc<TaskStore>,
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
    resolver: Arc<DependencyResolver>,
    checkpoints: Arc<CheckpointManager>,
    retry_service: Arc<dyn RetryService>,
    executor: Arc<dyn TaskExecutor>,
    in_flight: Arc<InFlightTracker>,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
    sweep_trigger: Arc<Notify>,
    task_timeout: Duration,
    poll_interval: Duration,
}

impl TaskDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        queue: Arc<TaskQueue>,
        registry: Arc<WorkerRegistry>,
        resolver: Arc<DependencyResolver>,
        checkpoints: Arc<CheckpointManager>,
        retry_service: Arc<dyn RetryService>,
        executor: Arc<dyn TaskExecutor>,
        in_flight: Arc<InFlightTracker>,
        wake: Arc<Notify>,
        sweep_trigger: Arc<Notify>,
        max_concurrent_tasks: usize,
        task_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            resolver,
            checkpoints,
            retry_service,
            executor,
            in_flight,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks)),
            wake,
            sweep_trigger,
            task_timeout,
            poll_interval,
        }
    }

    /// 当前空闲的全局执行槽位
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// 运行派发循环，直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("启动任务派发循环，轮询间隔 {:?}", self.poll_interval);

        loop {
            if let Err(e) = self.dispatch_pass().await {
                error!("派发任务时出错: {}", e);
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("收到关闭信号，退出任务派发循环");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// 执行一轮派发，返回本轮启动的任务数
    pub async fn dispatch_pass(self: &Arc<Self>) -> SchedulerResult<usize> {
        self.dispatch_ready_tasks()
            .instrument(info_span!("dispatch_pass"))
            .await
    }

    async fn dispatch_ready_tasks(self: &Arc<Self>) -> SchedulerResult<usize> {
        self.retry_service.scan_retry_tasks().await?;

        let mut dispatched = 0;
        let mut deferred = Vec::new();

        loop {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!("已达到全局并发上限，本轮派发结束");
                break;
            };
            let entry = match self.queue.pop_highest().await {
                Ok(entry) => entry,
                Err(SchedulerError::EmptyQueue) => break,
                Err(e) => return Err(e),
            };

            match self.try_assign(&entry, permit).await {
                Ok(AssignOutcome::Dispatched) => dispatched += 1,
                Ok(AssignOutcome::NoCapableWorker) => deferred.push(entry),
                Ok(AssignOutcome::Skipped) => {}
                Err(e) => warn!("派发任务 {} 失败: {}", entry.task_id, e),
            }
        }

        if !deferred.is_empty() {
            debug!("{} 个任务暂无可用Worker，放回队列", deferred.len());
        }
        for entry in deferred {
            self.queue.requeue(entry).await;
        }

        if dispatched > 0 {
            info!("本轮派发了 {} 个任务", dispatched);
        }
        Ok(dispatched)
    }

    async fn try_assign(
        self: &Arc<Self>,
        entry: &QueueEntry,
        permit: OwnedSemaphorePermit,
    ) -> SchedulerResult<AssignOutcome> {
        let task = self.store.get(&entry.task_id).await?;
        if task.status != TaskStatus::Queued {
            debug!("任务 {} 当前状态为 {}，跳过派发", task.id, task.status);
            return Ok(AssignOutcome::Skipped);
        }

        let candidates = self
            .registry
            .list_candidates(&task.required_capabilities(), task.min_resources.as_ref())
            .await;

        for candidate in candidates {
            let worker = match self.registry.reserve(&candidate.id).await {
                Ok(worker) => worker,
                Err(e) => {
                    debug!("Worker {} 无法接收任务: {}", candidate.id, e);
                    continue;
                }
            };

            let reason = format!("分配到Worker {}", worker.id);
            let assigned = self
                .store
                .update(&task.id, |t| {
                    t.transition_to(TaskStatus::Assigned, Some(reason))?;
                    t.attempts += 1;
                    t.assigned_worker = Some(worker.id.clone());
                    Ok(t.attempts)
                })
                .await;

            return match assigned {
                Ok(attempt) => {
                    if !self.confirm_assignment(task.id, attempt, &worker).await {
                        return Ok(AssignOutcome::Skipped);
                    }
                    self.spawn_execution(task.id, attempt, worker, permit).await;
                    Ok(AssignOutcome::Dispatched)
                }
                Err(e) => {
                    self.registry.release(&worker.id).await;
                    debug!("任务 {} 在派发期间状态已变化: {}", task.id, e);
                    Ok(AssignOutcome::Skipped)
                }
            };
        }

        debug!(
            "{}",
            SchedulerError::NoCapableWorker {
                task_type: task.task_type.clone()
            }
        );
        Ok(AssignOutcome::NoCapableWorker)
    }

    /// 任务进入 Assigned 后再次确认Worker状态
    ///
    /// 巡检可能在预留槽位和更新任务之间把Worker标记为不可达，那一轮回收看不到
    /// 这个任务。此时按Worker不可达处理本次执行，而不是把任务交给失效的Worker。
    pub(crate) async fn confirm_assignment(
        &self,
        task_id: TaskId,
        attempt: u32,
        worker: &Worker,
    ) -> bool {
        let reachable = matches!(
            self.registry.get(&worker.id).await,
            Ok(current) if current.status != WorkerStatus::Unreachable
        );
        if !reachable {
            warn!("Worker {} 在派发任务 {} 期间失效，放弃本次执行", worker.id, task_id);
            self.fail_task(
                task_id,
                attempt,
                worker,
                SchedulerError::worker_unreachable(&worker.id),
            )
            .await;
        }
        reachable
    }

    async fn spawn_execution(
        self: &Arc<Self>,
        task_id: TaskId,
        attempt: u32,
        worker: Worker,
        permit: OwnedSemaphorePermit,
    ) {
        info!(
            "派发任务 {} 到Worker {} (第 {} 次执行)",
            task_id, worker.id, attempt
        );
        metrics::counter!("devpool_tasks_dispatched_total").increment(1);

        let mut handles = self.in_flight.lock().await;
        let this = Arc::clone(self);
        let span = info_span!("execute_task", task_id = %task_id, attempt);
        let handle = tokio::spawn(
            async move {
                this.execute_task(task_id, attempt, worker).await;
                this.in_flight.finish(task_id, attempt).await;
                drop(permit);
                this.wake.notify_one();
            }
            .instrument(span),
        );
        handles.insert(task_id, (attempt, handle.abort_handle()));
    }

    /// 在租约仍然有效时把任务置为 Running
    async fn start_running(
        &self,
        task_id: TaskId,
        attempt: u32,
        worker: &Worker,
        reason: String,
    ) -> Option<Task> {
        let result = self
            .store
            .update(&task_id, |t| {
                if !t.holds_lease(attempt, &worker.id) {
                    return Ok(None);
                }
                t.transition_to(TaskStatus::Running, Some(reason))?;
                Ok(Some(t.clone()))
            })
            .await;

        match result {
            Ok(Some(task)) => Some(task),
            Ok(None) => {
                debug!("任务 {} 的第 {} 次执行租约已失效", task_id, attempt);
                None
            }
            Err(e) => {
                error!("任务 {} 无法进入运行状态: {}", task_id, e);
                None
            }
        }
    }

    async fn execute_task(&self, task_id: TaskId, attempt: u32, worker: Worker) {
        let started = Instant::now();
        let mut reason = format!("在Worker {} 上开始执行", worker.id);

        loop {
            let Some(task) = self.start_running(task_id, attempt, &worker, reason).await else {
                return;
            };

            let checkpoint = self.checkpoints.resume_point(task_id).await;
            if let Some(checkpoint) = &checkpoint {
                debug!("任务 {} 从检查点 #{} 恢复", task_id, checkpoint.sequence);
            }
            let request = ExecutionRequest {
                task_id,
                attempt,
                task_type: task.task_type.clone(),
                payload: task.payload.clone(),
                worker: worker.clone(),
                checkpoint,
                timeout: self.task_timeout,
            };

            let result =
                match tokio::time::timeout(self.task_timeout, self.executor.execute(request)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(SchedulerError::Timeout(format!(
                        "任务 {} 在Worker {} 上执行超过 {:?}",
                        task_id, worker.id, self.task_timeout
                    ))),
                };

            match result {
                Ok(ExecutionOutcome::Completed { output }) => {
                    self.complete_task(task_id, attempt, &worker, output).await;
                    break;
                }
                Ok(ExecutionOutcome::Yielded { progress }) => {
                    match self.record_progress(task_id, attempt, &worker, progress).await {
                        Some(sequence) => reason = format!("从检查点 #{sequence} 恢复执行"),
                        None => break,
                    }
                }
                Err(e) => {
                    self.fail_task(task_id, attempt, &worker, e).await;
                    break;
                }
            }
        }

        metrics::histogram!("devpool_task_execution_seconds")
            .record(started.elapsed().as_secs_f64());
    }

    async fn complete_task(
        &self,
        task_id: TaskId,
        attempt: u32,
        worker: &Worker,
        output: TaskPayload,
    ) {
        let won = self
            .store
            .update(&task_id, |t| {
                if !t.holds_lease(attempt, &worker.id) {
                    return Ok(false);
                }
                t.transition_to(
                    TaskStatus::Completed,
                    Some(format!("在Worker {} 上执行成功", worker.id)),
                )?;
                t.output = Some(output);
                t.assigned_worker = None;
                Ok(true)
            })
            .await;

        match won {
            Ok(true) => {
                self.registry.release(&worker.id).await;
                self.wake.notify_one();
                metrics::counter!("devpool_tasks_completed_total").increment(1);
                info!("任务 {} 在Worker {} 上执行完成", task_id, worker.id);
                if let Err(e) = self.resolver.compute_ready(task_id).await {
                    error!("计算任务 {} 的下游就绪状态时出错: {}", task_id, e);
                }
            }
            Ok(false) => debug!("忽略任务 {} 第 {} 次执行的过期完成结果", task_id, attempt),
            Err(e) => error!("记录任务 {} 完成状态时出错: {}", task_id, e),
        }
    }

    /// 保存阶段性进度并进入 Checkpointed，返回检查点序号；租约失效时返回 None
    async fn record_progress(
        &self,
        task_id: TaskId,
        attempt: u32,
        worker: &Worker,
        progress: TaskPayload,
    ) -> Option<u64> {
        let checkpoint = match self
            .checkpoints
            .save_for_attempt(task_id, attempt, &worker.id, progress)
            .await
        {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return None,
            Err(e) => {
                warn!("保存任务 {} 的检查点失败: {}", task_id, e);
                self.fail_task(task_id, attempt, worker, e).await;
                return None;
            }
        };
        metrics::counter!("devpool_checkpoints_written_total").increment(1);

        let sequence = checkpoint.sequence;
        let result = self
            .store
            .update(&task_id, |t| {
                if !t.holds_lease(attempt, &worker.id) {
                    return Ok(false);
                }
                t.transition_to(
                    TaskStatus::Checkpointed,
                    Some(format!("保存检查点 #{sequence}")),
                )?;
                Ok(true)
            })
            .await;

        match result {
            Ok(true) => Some(sequence),
            Ok(false) => {
                debug!("任务 {} 保存检查点后租约已失效", task_id);
                None
            }
            Err(e) => {
                error!("任务 {} 无法进入检查点状态: {}", task_id, e);
                None
            }
        }
    }

    async fn fail_task(&self, task_id: TaskId, attempt: u32, worker: &Worker, error: SchedulerError) {
        warn!(
            "任务 {} 在Worker {} 上第 {} 次执行失败: {}",
            task_id, worker.id, attempt, error
        );

        if let Err(e) = self
            .retry_service
            .handle_failed_task(task_id, attempt, &error)
            .await
        {
            error!("处理任务 {} 的失败时出错: {}", task_id, e);
        }

        if error.triggers_health_sweep() {
            debug!("Worker {} 可能已失效，请求立即巡检", worker.id);
            self.sweep_trigger.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;
    use devpool_domain::WorkerId;
    use devpool_infrastructure::InMemoryCheckpointStore;
    use devpool_testing_utils::MockExecutor;

    fn dispatcher_for(h: &Harness, executor: &MockExecutor) -> Arc<TaskDispatcher> {
        let checkpoints = Arc::new(CheckpointManager::new(
            h.store.clone(),
            Arc::new(InMemoryCheckpointStore::new()),
        ));
        Arc::new(TaskDispatcher::new(
            h.store.clone(),
            h.queue.clone(),
            h.registry.clone(),
            h.resolver.clone(),
            checkpoints,
            h.retry.clone(),
            Arc::new(executor.clone()),
            h.in_flight.clone(),
            h.wake.clone(),
            Arc::new(Notify::new()),
            2,
            Duration::from_secs(5),
            Duration::from_millis(10),
        ))
    }

    /// 接纳任务并模拟派发循环已经把它从队列取出
    async fn popped_task(h: &Harness) -> TaskId {
        let mut task = Task::new("code_generation", TaskPayload::new(), 0);
        task.max_retries = 3;
        let task_id = task.id;
        h.resolver.admit_batch(vec![task]).await.unwrap();
        h.queue.remove(&task_id).await;
        task_id
    }

    async fn assign(h: &Harness, task_id: TaskId, worker_id: &WorkerId) -> u32 {
        h.store
            .update(&task_id, |t| {
                t.transition_to(TaskStatus::Assigned, None)?;
                t.attempts += 1;
                t.assigned_worker = Some(worker_id.clone());
                Ok(t.attempts)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_assignment_to_worker_lost_mid_dispatch_is_retried() {
        let h = Harness::new();
        let executor = MockExecutor::new();
        let dispatcher = dispatcher_for(&h, &executor);
        h.add_worker("w1").await;
        let w1 = WorkerId::new("w1");
        let task_id = popped_task(&h).await;

        let worker = h.registry.reserve(&w1).await.unwrap();
        // 巡检恰好发生在预留槽位之后，此时任务仍是 Queued，回收不到它
        assert!(h.registry.mark_unreachable(&w1).await.unwrap());
        assert!(h.retry.handle_worker_failure(&w1).await.unwrap().is_empty());
        let attempt = assign(&h, task_id, &w1).await;

        assert!(!dispatcher.confirm_assignment(task_id, attempt, &worker).await);

        let task = h.store.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Retrying);
        assert_eq!(task.retry_count, 1);
        assert!(task.assigned_worker.is_none());
        assert!(task.last_error.unwrap().contains("Worker不可达"));
        assert_eq!(h.worker_load("w1").await, 0);
        assert!(executor.executions_of(task_id).is_empty());
    }

    #[tokio::test]
    async fn test_assignment_to_healthy_worker_is_kept() {
        let h = Harness::new();
        let executor = MockExecutor::new();
        let dispatcher = dispatcher_for(&h, &executor);
        h.add_worker("w1").await;
        let w1 = WorkerId::new("w1");
        let task_id = popped_task(&h).await;

        let worker = h.registry.reserve(&w1).await.unwrap();
        let attempt = assign(&h, task_id, &w1).await;

        assert!(dispatcher.confirm_assignment(task_id, attempt, &worker).await);
        let task = h.store.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.retry_count, 0);
        assert_eq!(h.worker_load("w1").await, 1);
    }
}
