use std::collections::{BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use devpool_errors::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

use crate::value_objects::{
    dispatch_score, Criticality, ResourceSpec, TaskId, TaskPayload, WorkerId, MAX_PRIORITY,
    MIN_PRIORITY,
};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已提交，依赖尚未满足
    Pending,
    /// 依赖已满足，等待Worker
    Queued,
    /// 已选定Worker，尚未确认开始执行
    Assigned,
    Running,
    /// 进度已保存，恢复后回到 Running
    Checkpointed,
    /// 执行失败且仍在重试预算内，退避结束后回到 Queued
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Checkpointed,
        TaskStatus::Retrying,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// 状态机合法转换表
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Queued) | (Pending, Failed) | (Pending, Cancelled) |
            (Queued, Assigned) | (Queued, Cancelled) |
            (Assigned, Running) | (Assigned, Retrying) | (Assigned, Failed) |
            (Running, Completed) | (Running, Checkpointed) | (Running, Retrying) |
            (Running, Failed) | (Running, Cancelled) |
            (Checkpointed, Running) | (Checkpointed, Retrying) |
            (Checkpointed, Failed) | (Checkpointed, Cancelled) |
            (Retrying, Queued) | (Retrying, Failed) | (Retrying, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// 是否占用着一个Worker槽位
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running | Self::Checkpointed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Checkpointed => "checkpointed",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// 一次状态转换的审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// 提交请求中的依赖引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyRef {
    /// 已存在于任务存储中的任务
    Task(TaskId),
    /// 同一批次中的另一个任务，按客户端键引用
    Local(String),
}

impl From<TaskId> for DependencyRef {
    fn from(id: TaskId) -> Self {
        DependencyRef::Task(id)
    }
}

/// 任务提交请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// 批次内的客户端键，仅用于批内依赖引用
    pub key: Option<String>,
    pub task_type: String,
    pub payload: TaskPayload,
    pub priority: i32,
    pub criticality: Criticality,
    pub dependencies: Vec<DependencyRef>,
    /// 未指定时使用配置中的默认值
    pub max_retries: Option<u32>,
    pub min_resources: Option<ResourceSpec>,
}

impl TaskSpec {
    pub fn new<S: Into<String>>(task_type: S) -> Self {
        Self {
            key: None,
            task_type: task_type.into(),
            payload: TaskPayload::new(),
            priority: 0,
            criticality: Criticality::Normal,
            dependencies: Vec::new(),
            max_retries: None,
            min_resources: None,
        }
    }

    pub fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: TaskPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn depends_on<D: Into<DependencyRef>>(mut self, dependency: D) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn depends_on_local<S: Into<String>>(mut self, key: S) -> Self {
        self.dependencies.push(DependencyRef::Local(key.into()));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_min_resources(mut self, resources: ResourceSpec) -> Self {
        self.min_resources = Some(resources);
        self
    }

    /// 同步校验提交请求的格式，不涉及任务存储
    pub fn validate(&self, max_retries_ceiling: u32) -> SchedulerResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(SchedulerError::validation_error("任务类型不能为空"));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(SchedulerError::validation_error(format!(
                "优先级必须在 {MIN_PRIORITY}..={MAX_PRIORITY} 之间，实际为 {}",
                self.priority
            )));
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries > max_retries_ceiling {
                return Err(SchedulerError::validation_error(format!(
                    "最大重试次数 {max_retries} 超过上限 {max_retries_ceiling}"
                )));
            }
        }
        if let Some(key) = &self.key {
            if key.trim().is_empty() {
                return Err(SchedulerError::validation_error("批次键不能为空字符串"));
            }
        }
        let mut seen = HashSet::new();
        for dependency in &self.dependencies {
            if !seen.insert(dependency) {
                return Err(SchedulerError::validation_error(format!(
                    "重复的依赖: {dependency:?}"
                )));
            }
        }
        Ok(())
    }
}

/// 任务记录，由任务存储在整个生命周期内持有
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub payload: TaskPayload,
    pub priority: i32,
    pub criticality: Criticality,
    pub status: TaskStatus,
    pub dependencies: Vec<TaskId>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 每次分配Worker时递增，作为执行租约的标识
    pub attempts: u32,
    /// 最新检查点的序号
    pub checkpoint_seq: Option<u64>,
    pub assigned_worker: Option<WorkerId>,
    pub min_resources: Option<ResourceSpec>,
    pub last_error: Option<String>,
    pub retry_not_before: Option<DateTime<Utc>>,
    pub output: Option<TaskPayload>,
    /// 提交序号，创建时间相同时保证严格FIFO
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusTransition>,
}

impl Task {
    pub fn new<S: Into<String>>(task_type: S, payload: TaskPayload, sequence: u64) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            priority: 0,
            criticality: Criticality::Normal,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            retry_count: 0,
            max_retries: 0,
            attempts: 0,
            checkpoint_seq: None,
            assigned_worker: None,
            min_resources: None,
            last_error: None,
            retry_not_before: None,
            output: None,
            sequence,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn dispatch_score(&self) -> i64 {
        dispatch_score(self.criticality, self.priority)
    }

    /// 任务类型即所需的能力标签
    pub fn required_capabilities(&self) -> BTreeSet<String> {
        BTreeSet::from([self.task_type.clone()])
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 执行结果只有在租约仍然有效时才会被采纳
    pub fn holds_lease(&self, attempt: u32, worker: &WorkerId) -> bool {
        self.status.is_in_flight()
            && self.attempts == attempt
            && self.assigned_worker.as_ref() == Some(worker)
    }

    /// 按状态机执行转换，非法转换返回 `InvalidStateTransition` 且不修改任务
    pub fn transition_to(
        &mut self,
        target: TaskStatus,
        reason: Option<String>,
    ) -> SchedulerResult<()> {
        if !self.status.can_transition_to(target) {
            return Err(SchedulerError::InvalidStateTransition {
                task: self.id.to_string(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        let now = Utc::now();
        self.history.push(StatusTransition {
            from: self.status,
            to: target,
            at: now,
            reason,
        });
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (类型: {}, 关键度: {}, 优先级: {})",
            self.id, self.task_type, self.criticality, self.priority
        )
    }
}
