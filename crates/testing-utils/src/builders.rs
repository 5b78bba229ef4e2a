//! 测试数据构造器

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use devpool_domain::{
    Criticality, DependencyRef, HealthStatus, ResourceSpec, TaskId, TaskPayload, TaskSpec,
    Worker, WorkerStatus,
};

/// 构造提交用的 `TaskSpec`
pub struct TaskSpecBuilder {
    spec: TaskSpec,
}

impl TaskSpecBuilder {
    pub fn new() -> Self {
        Self {
            spec: TaskSpec::new("code_generation"),
        }
    }

    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.spec.task_type = task_type.to_string();
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.spec.key = Some(key.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.spec.criticality = criticality;
        self
    }

    pub fn with_payload(mut self, payload: TaskPayload) -> Self {
        self.spec.payload = payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.spec.max_retries = Some(max_retries);
        self
    }

    pub fn with_min_resources(mut self, resources: ResourceSpec) -> Self {
        self.spec.min_resources = Some(resources);
        self
    }

    pub fn depends_on(mut self, task_id: TaskId) -> Self {
        self.spec.dependencies.push(DependencyRef::Task(task_id));
        self
    }

    pub fn depends_on_local(mut self, key: &str) -> Self {
        self.spec
            .dependencies
            .push(DependencyRef::Local(key.to_string()));
        self
    }

    pub fn build(self) -> TaskSpec {
        self.spec
    }
}

impl Default for TaskSpecBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 构造测试用Worker
pub struct WorkerBuilder {
    worker: Worker,
}

impl WorkerBuilder {
    pub fn new(id: &str) -> Self {
        let mut worker = Worker::new(id, "127.0.0.1", 22);
        worker.username = "dev".to_string();
        worker.capabilities = BTreeSet::from(["code_generation".to_string()]);
        worker.max_concurrent_tasks = 2;
        worker.resources = ResourceSpec::new(4, 8 << 30, 0);
        Self { worker }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.worker.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_max_tasks(mut self, max_tasks: u32) -> Self {
        self.worker.max_concurrent_tasks = max_tasks;
        self
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.worker.resources = resources;
        self
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.worker.status = status;
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.worker.health = health;
        self
    }

    pub fn with_current_tasks(mut self, count: u32) -> Self {
        self.worker.current_task_count = count;
        self
    }

    pub fn with_last_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.worker.last_heartbeat = at;
        self
    }

    /// 最近一次心跳发生在 `seconds` 秒之前
    pub fn with_heartbeat_age(self, seconds: i64) -> Self {
        self.with_last_heartbeat(Utc::now() - Duration::seconds(seconds))
    }

    pub fn build(self) -> Worker {
        self.worker
    }
}
