use std::sync::Arc;

use devpool_domain::{DependencyRef, Task, TaskId, TaskSpec, TaskStatus, WorkerId};
use devpool_testing_utils::{RecordingNotifier, WorkerBuilder};
use tokio::sync::Notify;

use crate::dependency_resolver::DependencyResolver;
use crate::in_flight::InFlightTracker;
use crate::priority_queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::retry_service::{RetryConfig, TaskRetryService};
use crate::task_store::TaskStore;

/// 组装好的内部组件，供各模块的单元测试使用
pub struct Harness {
    pub store: Arc<TaskStore>,
    pub queue: Arc<TaskQueue>,
    pub registry: Arc<WorkerRegistry>,
    pub resolver: Arc<DependencyResolver>,
    pub notifier: RecordingNotifier,
    pub in_flight: Arc<InFlightTracker>,
    pub wake: Arc<Notify>,
    pub retry: Arc<TaskRetryService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_retry_config(RetryConfig::default())
    }

    pub fn with_retry_config(config: RetryConfig) -> Self {
        let store = Arc::new(TaskStore::new());
        let queue = Arc::new(TaskQueue::new(100));
        let registry = Arc::new(WorkerRegistry::new());
        let notifier = RecordingNotifier::new();
        let resolver = Arc::new(DependencyResolver::new(
            store.clone(),
            queue.clone(),
            Arc::new(notifier.clone()),
        ));
        let in_flight = Arc::new(InFlightTracker::new());
        let wake = Arc::new(Notify::new());
        let retry = Arc::new(TaskRetryService::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            resolver.clone(),
            Arc::new(notifier.clone()),
            in_flight.clone(),
            wake.clone(),
            Some(config),
        ));

        Self {
            store,
            queue,
            registry,
            resolver,
            notifier,
            in_flight,
            wake,
            retry,
        }
    }

    pub async fn add_worker(&self, id: &str) {
        self.registry
            .register(WorkerBuilder::new(id).with_max_tasks(2).build())
            .await
            .unwrap();
    }

    pub async fn worker_load(&self, id: &str) -> u32 {
        self.registry
            .get(&WorkerId::new(id))
            .await
            .unwrap()
            .current_task_count
    }

    /// 接纳任务并直接置为在某个Worker上运行，返回租约序号
    pub async fn start_task(&self, spec: TaskSpec, worker: &str) -> (TaskId, u32) {
        let mut task = Task::new(spec.task_type, spec.payload, 0);
        task.priority = spec.priority;
        task.criticality = spec.criticality;
        task.max_retries = spec.max_retries.unwrap_or(3);
        task.min_resources = spec.min_resources;
        task.dependencies = spec
            .dependencies
            .into_iter()
            .filter_map(|d| match d {
                DependencyRef::Task(id) => Some(id),
                DependencyRef::Local(_) => None,
            })
            .collect();
        let task_id = task.id;

        self.resolver.admit_batch(vec![task]).await.unwrap();
        self.queue.remove(&task_id).await;

        let worker_id = WorkerId::new(worker);
        self.registry.reserve(&worker_id).await.unwrap();
        let attempt = self
            .store
            .update(&task_id, |t| {
                t.transition_to(TaskStatus::Assigned, None)?;
                t.attempts += 1;
                t.assigned_worker = Some(worker_id.clone());
                t.transition_to(TaskStatus::Running, None)?;
                Ok(t.attempts)
            })
            .await
            .unwrap();

        (task_id, attempt)
    }
}
