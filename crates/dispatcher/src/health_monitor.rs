use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use devpool_domain::{HealthStatus, TaskExecutor, Worker, WorkerId, WorkerStatus};
use devpool_errors::SchedulerResult;
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::registry::WorkerRegistry;
use crate::retry_service::{ReclaimReport, RetryService};

/// Worker健康监控配置
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// 巡检间隔，同时也是判定降级的心跳年龄阈值
    pub check_interval: Duration,
    /// 心跳年龄超过 `check_interval * heartbeat_miss_multiple` 时判定不可达
    pub heartbeat_miss_multiple: u32,
    /// 巡检前是否主动探测每个Worker
    pub active_probing: bool,
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            heartbeat_miss_multiple: 3,
            active_probing: true,
            probe_timeout: Duration::from_secs(10),
        }
    }
}

impl HealthMonitorConfig {
    pub fn unreachable_after(&self) -> Duration {
        self.check_interval * self.heartbeat_miss_multiple
    }
}

/// 一次巡检的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub probed: usize,
    pub probe_failures: Vec<WorkerId>,
    pub degraded: Vec<WorkerId>,
    pub unreachable: Vec<WorkerId>,
    pub recovered: Vec<WorkerId>,
    pub reclaimed: ReclaimReport,
}

/// Worker健康监控服务接口
#[async_trait]
pub trait HealthMonitorService: Send + Sync {
    /// 执行一次完整巡检
    async fn sweep(&self) -> SchedulerResult<SweepReport>;

    /// 心跳超过不可达阈值、尚未标记为不可达的Worker
    async fn detect_failed_workers(&self) -> Vec<Worker>;

    /// 标记Worker不可达并回收其任务，已处理过的Worker返回空结果
    async fn handle_failed_worker(&self, worker_id: &WorkerId) -> SchedulerResult<ReclaimReport>;
}

/// Worker健康监控实现
pub struct WorkerHealthMonitor {
    registry: Arc<WorkerRegistry>,
    executor: Arc<dyn TaskExecutor>,
    retry_service: Arc<dyn RetryService>,
    sweep_trigger: Arc<Notify>,
    config: HealthMonitorConfig,
    sweep_lock: Mutex<()>,
}

impl WorkerHealthMonitor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        executor: Arc<dyn TaskExecutor>,
        retry_service: Arc<dyn RetryService>,
        sweep_trigger: Arc<Notify>,
        config: Option<HealthMonitorConfig>,
    ) -> Self {
        Self {
            registry,
            executor,
            retry_service,
            sweep_trigger,
            config: config.unwrap_or_default(),
            sweep_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// 主动探测所有未注销的Worker，探测成功视为一次心跳
    async fn probe_workers(&self, workers: &[Worker], report: &mut SweepReport) {
        let probes = workers.iter().map(|worker| async move {
            let result =
                tokio::time::timeout(self.config.probe_timeout, self.executor.probe(worker)).await;
            (worker.id.clone(), result)
        });

        for (worker_id, result) in join_all(probes).await {
            report.probed += 1;
            match result {
                Ok(Ok(())) => {
                    if let Err(e) = self.registry.record_heartbeat(&worker_id).await {
                        debug!("探测期间Worker {} 已注销: {}", worker_id, e);
                    }
                }
                Ok(Err(e)) => {
                    debug!("探测Worker {} 失败: {}", worker_id, e);
                    report.probe_failures.push(worker_id);
                }
                Err(_) => {
                    debug!(
                        "探测Worker {} 超时 ({:?})",
                        worker_id, self.config.probe_timeout
                    );
                    report.probe_failures.push(worker_id);
                }
            }
        }
    }

    fn heartbeat_age(worker: &Worker) -> Duration {
        worker
            .heartbeat_age(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// 按心跳年龄更新单个Worker的健康状态
    async fn check_worker(&self, worker: &Worker, report: &mut SweepReport) -> SchedulerResult<()> {
        let age = Self::heartbeat_age(worker);
        let degraded_after = self.config.check_interval;

        if worker.status == WorkerStatus::Unreachable {
            if age <= degraded_after && self.registry.recover(&worker.id).await? {
                report.recovered.push(worker.id.clone());
            }
            return Ok(());
        }

        if age > self.config.unreachable_after() {
            let reclaimed = self.handle_failed_worker(&worker.id).await?;
            report.unreachable.push(worker.id.clone());
            report.reclaimed.requeued.extend(reclaimed.requeued);
            report.reclaimed.failed.extend(reclaimed.failed);
        } else if age > degraded_after {
            let previous = self
                .registry
                .set_health(&worker.id, HealthStatus::Degraded)
                .await?;
            if previous != HealthStatus::Degraded {
                warn!("Worker {} 心跳延迟 {:?}，标记为降级", worker.id, age);
                report.degraded.push(worker.id.clone());
            }
        } else if worker.health != HealthStatus::Healthy {
            self.registry
                .set_health(&worker.id, HealthStatus::Healthy)
                .await?;
        }
        Ok(())
    }

    async fn sweep_once(&self) -> SchedulerResult<SweepReport> {
        let started = Instant::now();
        let mut report = SweepReport::default();

        if self.config.active_probing {
            let workers = self.registry.list().await;
            self.probe_workers(&workers, &mut report).await;
        }

        for worker in self.registry.list().await {
            if let Err(e) = self.check_worker(&worker, &mut report).await {
                warn!("巡检Worker {} 时出错: {}", worker.id, e);
            }
        }

        debug!(
            "巡检完成，耗时 {:?}: 探测 {}，降级 {}，不可达 {}，恢复 {}",
            started.elapsed(),
            report.probed,
            report.degraded.len(),
            report.unreachable.len(),
            report.recovered.len()
        );
        Ok(report)
    }

    /// 运行巡检循环，直到收到关闭信号
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "启动Worker健康巡检循环，间隔 {:?}，不可达阈值 {:?}",
            self.config.check_interval,
            self.config.unreachable_after()
        );

        loop {
            match self.sweep().await {
                Ok(report) => {
                    if !report.unreachable.is_empty() {
                        info!(
                            "巡检发现 {} 个不可达的Worker，回收 {} 个任务",
                            report.unreachable.len(),
                            report.reclaimed.total()
                        );
                    }
                }
                Err(e) => error!("Worker健康巡检时出错: {}", e),
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!("收到关闭信号，退出Worker健康巡检循环");
                    break;
                }
                _ = self.sweep_trigger.notified() => {
                    debug!("收到立即巡检请求");
                }
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }
    }
}

#[async_trait]
impl HealthMonitorService for WorkerHealthMonitor {
    async fn sweep(&self) -> SchedulerResult<SweepReport> {
        let _guard = self.sweep_lock.lock().await;
        self.sweep_once()
            .instrument(info_span!("health_sweep"))
            .await
    }

    async fn detect_failed_workers(&self) -> Vec<Worker> {
        let unreachable_after = self.config.unreachable_after();
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Unreachable)
            .filter(|w| Self::heartbeat_age(w) > unreachable_after)
            .collect()
    }

    async fn handle_failed_worker(&self, worker_id: &WorkerId) -> SchedulerResult<ReclaimReport> {
        if !self.registry.mark_unreachable(worker_id).await? {
            debug!("Worker {} 已处于不可达状态，跳过回收", worker_id);
            return Ok(ReclaimReport::default());
        }
        info!("处理失效Worker: {}", worker_id);
        self.retry_service.handle_worker_failure(worker_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;
    use devpool_domain::TaskStatus;
    use devpool_testing_utils::{MockExecutor, TaskSpecBuilder, WorkerBuilder};

    fn config(active_probing: bool) -> HealthMonitorConfig {
        HealthMonitorConfig {
            check_interval: Duration::from_secs(10),
            heartbeat_miss_multiple: 3,
            active_probing,
            probe_timeout: Duration::from_secs(1),
        }
    }

    fn monitor(h: &Harness, executor: MockExecutor, active_probing: bool) -> WorkerHealthMonitor {
        WorkerHealthMonitor::new(
            h.registry.clone(),
            Arc::new(executor),
            h.retry.clone(),
            Arc::new(Notify::new()),
            Some(config(active_probing)),
        )
    }

    async fn age_heartbeat(h: &Harness, id: &str, seconds: i64) {
        let worker = h.registry.deregister(&WorkerId::new(id)).await.unwrap();
        let aged = WorkerBuilder::new(id)
            .with_max_tasks(worker.max_concurrent_tasks)
            .with_heartbeat_age(seconds)
            .build();
        h.registry.register(aged).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_worker_becomes_unreachable_and_tasks_reclaimed() {
        let h = Harness::new();
        h.registry
            .register(WorkerBuilder::new("w1").with_heartbeat_age(60).build())
            .await
            .unwrap();
        let (task_id, _) = h
            .start_task(TaskSpecBuilder::new().with_max_retries(3).build(), "w1")
            .await;
        let monitor = monitor(&h, MockExecutor::new(), false);

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.unreachable, vec![WorkerId::new("w1")]);
        assert_eq!(report.reclaimed.requeued, vec![task_id]);

        let worker = h.registry.get(&WorkerId::new("w1")).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Unreachable);
        assert_eq!(worker.health, HealthStatus::Unhealthy);
        assert_eq!(
            h.store.get(&task_id).await.unwrap().status,
            TaskStatus::Queued
        );

        // 第二次巡检不会重复回收
        let again = monitor.sweep().await.unwrap();
        assert!(again.unreachable.is_empty());
        assert!(again.reclaimed.is_empty());
        assert_eq!(h.queue.len().await, 1);
        assert_eq!(h.store.get(&task_id).await.unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_late_heartbeat_marks_degraded() {
        let h = Harness::new();
        h.registry
            .register(WorkerBuilder::new("w1").with_heartbeat_age(15).build())
            .await
            .unwrap();
        let monitor = monitor(&h, MockExecutor::new(), false);

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.degraded, vec![WorkerId::new("w1")]);
        let worker = h.registry.get(&WorkerId::new("w1")).await.unwrap();
        assert_eq!(worker.health, HealthStatus::Degraded);
        assert_eq!(worker.status, WorkerStatus::Active);

        h.registry
            .record_heartbeat(&WorkerId::new("w1"))
            .await
            .unwrap();
        monitor.sweep().await.unwrap();
        assert_eq!(
            h.registry.get(&WorkerId::new("w1")).await.unwrap().health,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_successful_probe_counts_as_heartbeat() {
        let h = Harness::new();
        h.registry
            .register(WorkerBuilder::new("w1").with_heartbeat_age(600).build())
            .await
            .unwrap();
        let executor = MockExecutor::new();
        let monitor = monitor(&h, executor.clone(), true);

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.probed, 1);
        assert!(report.unreachable.is_empty());
        assert_eq!(executor.probe_count(), 1);
        assert_eq!(
            h.registry.get(&WorkerId::new("w1")).await.unwrap().status,
            WorkerStatus::Active
        );
    }

    #[tokio::test]
    async fn test_failed_probe_leaves_heartbeat_untouched() {
        let h = Harness::new();
        h.registry
            .register(WorkerBuilder::new("w1").with_heartbeat_age(600).build())
            .await
            .unwrap();
        let executor = MockExecutor::new();
        executor.set_unreachable("w1", true);
        let monitor = monitor(&h, executor, true);

        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.probe_failures, vec![WorkerId::new("w1")]);
        assert_eq!(report.unreachable, vec![WorkerId::new("w1")]);
    }

    #[tokio::test]
    async fn test_unreachable_worker_recovers_after_fresh_heartbeat() {
        let h = Harness::new();
        h.add_worker("w1").await;
        age_heartbeat(&h, "w1", 600).await;
        let monitor = monitor(&h, MockExecutor::new(), false);

        monitor.sweep().await.unwrap();
        assert_eq!(
            h.registry.get(&WorkerId::new("w1")).await.unwrap().status,
            WorkerStatus::Unreachable
        );

        h.registry
            .record_heartbeat(&WorkerId::new("w1"))
            .await
            .unwrap();
        let report = monitor.sweep().await.unwrap();
        assert_eq!(report.recovered, vec![WorkerId::new("w1")]);
        let worker = h.registry.get(&WorkerId::new("w1")).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Active);
        assert_eq!(worker.health, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_detect_failed_workers() {
        let h = Harness::new();
        h.add_worker("fresh").await;
        h.registry
            .register(WorkerBuilder::new("stale").with_heartbeat_age(120).build())
            .await
            .unwrap();
        let monitor = monitor(&h, MockExecutor::new(), false);

        let failed = monitor.detect_failed_workers().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id.as_str(), "stale");

        let reclaimed = monitor
            .handle_failed_worker(&WorkerId::new("stale"))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());
        assert!(monitor.detect_failed_workers().await.is_empty());
    }
}
