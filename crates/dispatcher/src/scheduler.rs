use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use devpool_domain::{
    Checkpoint, CheckpointStore, CommandOutput, DependencyRef, HealthStatus, SchedulerStats, Task,
    TaskExecutor, TaskId, TaskNotifier, TaskPayload, TaskSpec, TaskStatus, TaskView, Worker,
    WorkerHealthReport, WorkerId, WorkerStatus, WorkerView,
};
use devpool_errors::{SchedulerError, SchedulerResult};
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::checkpoint_manager::CheckpointManager;
use crate::config::SchedulerConfig;
use crate::controller::TaskController;
use crate::dependency_resolver::DependencyResolver;
use crate::dispatcher::TaskDispatcher;
use crate::health_monitor::{HealthMonitorService, SweepReport, WorkerHealthMonitor};
use crate::in_flight::InFlightTracker;
use crate::priority_queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::retry_service::{RetryService, TaskRetryService};
use crate::task_store::TaskStore;

/// 调度器对外接口
///
/// 负责组装内部组件，并提供任务提交、查询、取消以及Worker管理等操作。
/// `start` 之后派发循环和健康巡检在后台运行。
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<TaskStore>,
    queue: Arc<TaskQueue>,
    registry: Arc<WorkerRegistry>,
    resolver: Arc<DependencyResolver>,
    checkpoints: Arc<CheckpointManager>,
    retry_service: Arc<TaskRetryService>,
    dispatcher: Arc<TaskDispatcher>,
    monitor: Arc<WorkerHealthMonitor>,
    controller: TaskController,
    executor: Arc<dyn TaskExecutor>,
    in_flight: Arc<InFlightTracker>,
    wake: Arc<Notify>,
    shutdown_tx: broadcast::Sender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn TaskExecutor>,
        notifier: Arc<dyn TaskNotifier>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Self {
        let store = Arc::new(TaskStore::new());
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let registry = Arc::new(WorkerRegistry::new());
        let resolver = Arc::new(DependencyResolver::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(store.clone(), checkpoint_store));
        let in_flight = Arc::new(InFlightTracker::new());
        let wake = Arc::new(Notify::new());
        let sweep_trigger = Arc::new(Notify::new());

        let retry_service = Arc::new(TaskRetryService::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            resolver.clone(),
            notifier,
            in_flight.clone(),
            wake.clone(),
            Some(config.retry.clone()),
        ));
        let monitor = Arc::new(WorkerHealthMonitor::new(
            registry.clone(),
            executor.clone(),
            retry_service.clone(),
            sweep_trigger.clone(),
            Some(config.health.clone()),
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            resolver.clone(),
            checkpoints.clone(),
            retry_service.clone(),
            executor.clone(),
            in_flight.clone(),
            wake.clone(),
            sweep_trigger,
            config.max_concurrent_tasks,
            config.task_timeout,
            config.poll_interval,
        ));
        let controller = TaskController::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            resolver.clone(),
            retry_service.clone(),
            executor.clone(),
            in_flight.clone(),
            wake.clone(),
            config.cancel_grace,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            store,
            queue,
            registry,
            resolver,
            checkpoints,
            retry_service,
            dispatcher,
            monitor,
            controller,
            executor,
            in_flight,
            wake,
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ---- 任务 ----

    /// 提交单个任务
    pub async fn submit_task(&self, spec: TaskSpec) -> SchedulerResult<TaskId> {
        let ids = self.submit_batch(vec![spec]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| SchedulerError::Internal("提交结果为空".to_string()))
    }

    /// 整批提交，批内任务可以通过客户端键互相依赖；任何一项校验失败则整批都不写入
    pub async fn submit_batch(&self, specs: Vec<TaskSpec>) -> SchedulerResult<Vec<TaskId>> {
        if specs.is_empty() {
            return Err(SchedulerError::validation_error("提交的任务批次为空"));
        }
        for spec in &specs {
            spec.validate(self.config.max_retries_ceiling)?;
        }

        let tasks = self.build_batch(specs)?;
        let ids = self.resolver.admit_batch(tasks).await?;
        self.wake.notify_one();

        info!("接纳 {} 个新任务", ids.len());
        Ok(ids)
    }

    fn build_batch(&self, specs: Vec<TaskSpec>) -> SchedulerResult<Vec<Task>> {
        let mut keys: HashMap<String, TaskId> = HashMap::new();
        let mut tasks = Vec::with_capacity(specs.len());

        for spec in &specs {
            let mut task = Task::new(spec.task_type.clone(), spec.payload.clone(), 0);
            task.priority = spec.priority;
            task.criticality = spec.criticality;
            task.max_retries = spec.max_retries.unwrap_or(self.config.default_max_retries);
            task.min_resources = spec.min_resources;

            if let Some(key) = &spec.key {
                if keys.insert(key.clone(), task.id).is_some() {
                    return Err(SchedulerError::validation_error(format!(
                        "批次中存在重复的任务键: {key}"
                    )));
                }
            }
            tasks.push(task);
        }

        for (task, spec) in tasks.iter_mut().zip(&specs) {
            let task_id = task.id;
            task.dependencies = spec
                .dependencies
                .iter()
                .map(|dependency| match dependency {
                    DependencyRef::Task(id) => Ok(*id),
                    DependencyRef::Local(key) => {
                        keys.get(key)
                            .copied()
                            .ok_or_else(|| SchedulerError::UnknownDependency {
                                task: spec.key.clone().unwrap_or_else(|| task_id.to_string()),
                                dependency: key.clone(),
                            })
                    }
                })
                .collect::<SchedulerResult<Vec<_>>>()?;
        }

        Ok(tasks)
    }

    pub async fn get_task(&self, task_id: TaskId) -> SchedulerResult<TaskView> {
        let task = self.store.get(&task_id).await?;
        Ok(TaskView::from(&task))
    }

    /// 按提交顺序列出任务
    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Vec<TaskView> {
        self.store
            .list(status)
            .await
            .iter()
            .map(TaskView::from)
            .collect()
    }

    pub async fn cancel_task(&self, task_id: TaskId) -> SchedulerResult<TaskView> {
        self.controller.cancel_task(task_id).await
    }

    // ---- 检查点 ----

    /// 保存任务进度，任务状态不变
    pub async fn save_progress(
        &self,
        task_id: TaskId,
        payload: TaskPayload,
    ) -> SchedulerResult<Checkpoint> {
        self.checkpoints.save(task_id, payload).await
    }

    pub async fn latest_checkpoint(&self, task_id: TaskId) -> SchedulerResult<Checkpoint> {
        self.checkpoints.latest(task_id).await
    }

    pub async fn list_checkpoints(&self, task_id: TaskId) -> SchedulerResult<Vec<Checkpoint>> {
        self.checkpoints.list(task_id).await
    }

    // ---- Worker ----

    pub async fn register_worker(&self, worker: Worker) -> SchedulerResult<()> {
        self.registry.register(worker).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// 注销Worker，先停止分配新任务并回收其上的任务
    pub async fn deregister_worker(&self, worker_id: &WorkerId) -> SchedulerResult<WorkerView> {
        self.registry.drain(worker_id).await?;
        let reclaimed = self.retry_service.handle_worker_failure(worker_id).await?;
        if !reclaimed.is_empty() {
            info!(
                "注销Worker {} 前回收了 {} 个任务",
                worker_id,
                reclaimed.total()
            );
        }
        let worker = self.registry.deregister(worker_id).await?;
        Ok(WorkerView::from(&worker))
    }

    /// 停止向Worker分配新任务，已在执行的任务不受影响
    pub async fn drain_worker(&self, worker_id: &WorkerId) -> SchedulerResult<()> {
        self.registry.drain(worker_id).await
    }

    pub async fn record_heartbeat(&self, worker_id: &WorkerId) -> SchedulerResult<()> {
        self.registry.record_heartbeat(worker_id).await
    }

    /// 可以接收新任务的Worker
    pub async fn get_available_workers(&self) -> Vec<WorkerView> {
        self.registry
            .list()
            .await
            .iter()
            .filter(|w| w.status == WorkerStatus::Active && w.health != HealthStatus::Unhealthy)
            .map(WorkerView::from)
            .collect()
    }

    pub async fn get_worker_stats(&self) -> SchedulerStats {
        let registry_stats = self.registry.stats().await;
        let tasks_by_status = self.store.count_by_status().await;

        SchedulerStats {
            total_workers: registry_stats.total,
            active_workers: registry_stats
                .by_status
                .get(&WorkerStatus::Active)
                .copied()
                .unwrap_or(0),
            total_tasks: tasks_by_status.values().sum(),
            tasks_by_status,
        }
    }

    /// 在截止时间内并发探测所有Worker，探测成功记为一次心跳
    pub async fn health_check(
        &self,
        deadline: Duration,
    ) -> BTreeMap<WorkerId, WorkerHealthReport> {
        let workers = self.registry.list().await;
        let probes = workers.iter().map(|worker| async move {
            let started = Instant::now();
            let result = tokio::time::timeout(deadline, self.executor.probe(worker)).await;
            (worker.id.clone(), started.elapsed(), result)
        });

        let mut reports = BTreeMap::new();
        for (worker_id, elapsed, result) in join_all(probes).await {
            let (latency_ms, error) = match result {
                Ok(Ok(())) => {
                    if let Err(e) = self.registry.record_heartbeat(&worker_id).await {
                        debug!("健康检查期间Worker {} 已注销: {}", worker_id, e);
                    }
                    (Some(elapsed.as_millis() as u64), None)
                }
                Ok(Err(e)) => (None, Some(e.to_string())),
                Err(_) => (
                    None,
                    Some(SchedulerError::Timeout(format!("健康检查超过 {deadline:?}")).to_string()),
                ),
            };

            let Ok(worker) = self.registry.get(&worker_id).await else {
                continue;
            };
            reports.insert(
                worker_id,
                WorkerHealthReport {
                    status: worker.status,
                    health: worker.health,
                    latency_ms,
                    error,
                },
            );
        }
        reports
    }

    /// 在指定Worker上执行命令
    pub async fn execute_command(
        &self,
        deadline: Duration,
        worker_id: &WorkerId,
        command: &str,
    ) -> SchedulerResult<CommandOutput> {
        let worker = self.registry.get(worker_id).await?;
        if worker.status == WorkerStatus::Unreachable {
            return Err(SchedulerError::worker_unreachable(worker_id));
        }

        debug!("在Worker {} 上执行命令: {}", worker_id, command);
        match tokio::time::timeout(deadline, self.executor.run_command(&worker, command)).await {
            Ok(result) => result,
            Err(_) => Err(SchedulerError::Timeout(format!(
                "在Worker {worker_id} 上执行命令超过 {deadline:?}"
            ))),
        }
    }

    // ---- 生命周期 ----

    /// 启动派发循环和健康巡检
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut background = self.background.lock().await;
        if !background.is_empty() {
            return Err(SchedulerError::Internal("调度器已经启动".to_string()));
        }

        background.push(tokio::spawn(
            self.dispatcher.clone().run(self.shutdown_tx.subscribe()),
        ));
        background.push(tokio::spawn(
            self.monitor.clone().run(self.shutdown_tx.subscribe()),
        ));

        info!(
            "调度器已启动，全局并发上限 {}，队列容量 {}",
            self.config.max_concurrent_tasks, self.config.queue_capacity
        );
        Ok(())
    }

    /// 停止后台循环并中止所有执行中的任务
    pub async fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.background.lock().await);
        if self.shutdown_tx.send(()).is_err() {
            debug!("没有运行中的后台循环");
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("等待后台循环退出时出错: {}", e);
            }
        }

        let aborted = self.in_flight.abort_all().await;
        info!("调度器已关闭，中止了 {} 个执行中的任务", aborted);
    }

    // ---- 手动驱动，供测试和运维使用 ----

    /// 立即执行一轮派发
    pub async fn dispatch_now(&self) -> SchedulerResult<usize> {
        self.dispatcher.dispatch_pass().await
    }

    /// 立即执行一次健康巡检
    pub async fn run_health_sweep(&self) -> SchedulerResult<SweepReport> {
        self.monitor.sweep().await
    }

    /// 立即把到期的重试任务放回队列
    pub async fn promote_due_retries(&self) -> SchedulerResult<Vec<TaskId>> {
        self.retry_service.scan_retry_tasks().await
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.len().await
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.len().await
    }
}
