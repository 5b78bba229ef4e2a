use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use devpool_domain::{
    HealthStatus, RegistryStats, ResourceSpec, Worker, WorkerId, WorkerStatus,
};
use devpool_errors::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Worker注册表
///
/// 状态与健康度只由健康监控（以及显式的drain）修改，
/// 已分配任务数只通过 `reserve` / `release` 修改。
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, mut worker: Worker) -> SchedulerResult<()> {
        if worker.max_concurrent_tasks == 0 {
            return Err(SchedulerError::validation_error(format!(
                "Worker {} 的最大并发任务数必须大于0",
                worker.id
            )));
        }
        if worker.capabilities.is_empty() {
            return Err(SchedulerError::validation_error(format!(
                "Worker {} 未声明任何能力",
                worker.id
            )));
        }

        let mut workers = self.workers.write().await;
        if workers.contains_key(&worker.id) {
            return Err(SchedulerError::DuplicateWorker {
                id: worker.id.to_string(),
            });
        }

        worker.registered_at = Utc::now();
        worker.current_task_count = 0;
        info!(
            "注册Worker: {} ({}), 能力: {:?}, 容量: {}",
            worker.id, worker.address, worker.capabilities, worker.max_concurrent_tasks
        );
        workers.insert(worker.id.clone(), worker);
        metrics::gauge!("devpool_registered_workers").set(workers.len() as f64);
        Ok(())
    }

    pub async fn deregister(&self, id: &WorkerId) -> SchedulerResult<Worker> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .remove(id)
            .ok_or_else(|| SchedulerError::worker_not_found(id))?;
        info!("注销Worker: {}", id);
        metrics::gauge!("devpool_registered_workers").set(workers.len() as f64);
        Ok(worker)
    }

    pub async fn get(&self, id: &WorkerId) -> SchedulerResult<Worker> {
        self.workers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::worker_not_found(id))
    }

    /// 按ID排序返回全部Worker
    pub async fn list(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// 可以接收任务的候选Worker，负载低的在前
    pub async fn list_candidates(
        &self,
        required_capabilities: &BTreeSet<String>,
        min_resources: Option<&ResourceSpec>,
    ) -> Vec<Worker> {
        let workers = self.workers.read().await;
        let mut candidates: Vec<Worker> = workers
            .values()
            .filter(|w| w.can_accept(required_capabilities, min_resources))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            a.current_task_count
                .cmp(&b.current_task_count)
                .then_with(|| a.load_percentage().total_cmp(&b.load_percentage()))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// 占用Worker的一个执行槽位，返回占用后的Worker快照
    pub async fn reserve(&self, id: &WorkerId) -> SchedulerResult<Worker> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| SchedulerError::worker_not_found(id))?;

        if worker.status == WorkerStatus::Unreachable {
            return Err(SchedulerError::worker_unreachable(id));
        }
        if !worker.is_schedulable() {
            return Err(SchedulerError::WorkerAtCapacity { id: id.to_string() });
        }

        worker.current_task_count += 1;
        debug!(
            "占用Worker {} 槽位: {}/{}",
            id, worker.current_task_count, worker.max_concurrent_tasks
        );
        Ok(worker.clone())
    }

    /// 释放槽位，Worker已注销时忽略
    pub async fn release(&self, id: &WorkerId) {
        let mut workers = self.workers.write().await;
        match workers.get_mut(id) {
            Some(worker) => {
                if worker.current_task_count == 0 {
                    warn!("Worker {} 的任务计数已为0，忽略释放", id);
                } else {
                    worker.current_task_count -= 1;
                }
            }
            None => debug!("释放已注销Worker {} 的槽位", id),
        }
    }

    pub async fn record_heartbeat(&self, id: &WorkerId) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| SchedulerError::worker_not_found(id))?;
        worker.last_heartbeat = Utc::now();
        Ok(())
    }

    /// 返回修改前的健康状态
    pub async fn set_health(
        &self,
        id: &WorkerId,
        health: HealthStatus,
    ) -> SchedulerResult<HealthStatus> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| SchedulerError::worker_not_found(id))?;
        let previous = worker.health;
        if previous != health {
            info!("Worker {} 健康状态变化: {} -> {}", id, previous, health);
            worker.health = health;
        }
        Ok(previous)
    }

    /// 标记为不可达，只有真正发生状态变化时返回 true
    pub async fn mark_unreachable(&self, id: &WorkerId) -> SchedulerResult<bool> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| SchedulerError::worker_not_found(id))?;
        if worker.status == WorkerStatus::Unreachable {
            return Ok(false);
        }
        warn!("Worker {} 被标记为不可达 (原状态: {})", id, worker.status);
        worker.status = WorkerStatus::Unreachable;
        worker.health = HealthStatus::Unhealthy;
        Ok(true)
    }

    /// 不可达的Worker恢复心跳后重新投入使用
    pub async fn recover(&self, id: &WorkerId) -> SchedulerResult<bool> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| SchedulerError::worker_not_found(id))?;
        if worker.status != WorkerStatus::Unreachable {
            return Ok(false);
        }
        info!("Worker {} 恢复可用", id);
        worker.status = WorkerStatus::Active;
        worker.health = HealthStatus::Healthy;
        Ok(true)
    }

    pub async fn drain(&self, id: &WorkerId) -> SchedulerResult<()> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| SchedulerError::worker_not_found(id))?;
        if worker.status == WorkerStatus::Active {
            info!("Worker {} 进入排空状态", id);
            worker.status = WorkerStatus::Draining;
        }
        Ok(())
    }

    pub async fn stats(&self) -> RegistryStats {
        let workers = self.workers.read().await;
        let mut stats = RegistryStats {
            total: workers.len(),
            ..Default::default()
        };
        for worker in workers.values() {
            *stats.by_status.entry(worker.status).or_insert(0) += 1;
            *stats.by_health.entry(worker.health).or_insert(0) += 1;
        }
        stats
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}
