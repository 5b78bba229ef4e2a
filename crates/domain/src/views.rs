//! 对外暴露的只读视图，调用方拿到的是快照而不是内部记录

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{HealthStatus, StatusTransition, Task, TaskStatus, Worker, WorkerStatus};
use crate::value_objects::{Criticality, ResourceSpec, TaskId, TaskPayload, WorkerId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub task_type: String,
    pub priority: i32,
    pub criticality: Criticality,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub attempts: u32,
    pub assigned_worker: Option<WorkerId>,
    pub checkpoint_seq: Option<u64>,
    pub last_error: Option<String>,
    pub output: Option<TaskPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusTransition>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type.clone(),
            priority: task.priority,
            criticality: task.criticality,
            status: task.status,
            dependencies: task.dependencies.clone(),
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            attempts: task.attempts,
            assigned_worker: task.assigned_worker.clone(),
            checkpoint_seq: task.checkpoint_seq,
            last_error: task.last_error.clone(),
            output: task.output.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            history: task.history.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerView {
    pub id: WorkerId,
    pub display_name: String,
    pub address: String,
    pub capabilities: BTreeSet<String>,
    pub resources: ResourceSpec,
    pub status: WorkerStatus,
    pub health: HealthStatus,
    pub current_task_count: u32,
    pub max_concurrent_tasks: u32,
    pub load_percentage: f64,
    pub last_heartbeat: DateTime<Utc>,
}

impl From<&Worker> for WorkerView {
    fn from(worker: &Worker) -> Self {
        Self {
            id: worker.id.clone(),
            display_name: worker.display_name.clone(),
            address: worker.address.to_string(),
            capabilities: worker.capabilities.clone(),
            resources: worker.resources,
            status: worker.status,
            health: worker.health,
            current_task_count: worker.current_task_count,
            max_concurrent_tasks: worker.max_concurrent_tasks,
            load_percentage: worker.load_percentage(),
            last_heartbeat: worker.last_heartbeat,
        }
    }
}

/// Worker注册表统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_status: BTreeMap<WorkerStatus, usize>,
    pub by_health: BTreeMap<HealthStatus, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub total_tasks: usize,
    pub tasks_by_status: BTreeMap<TaskStatus, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealthReport {
    pub status: WorkerStatus,
    pub health: HealthStatus,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// 在Worker上执行命令的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
