use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::{ResourceSpec, WorkerId};

/// Worker调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    /// 不再接收新任务，已分配的任务继续执行
    Draining,
    Unreachable,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Worker健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 远程Worker节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub display_name: String,
    pub address: WorkerAddress,
    pub username: String,
    /// 凭据引用，调度器不解析其内容
    pub credential_ref: String,
    pub capabilities: BTreeSet<String>,
    pub resources: ResourceSpec,
    pub max_concurrent_tasks: u32,
    pub status: WorkerStatus,
    pub health: HealthStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub current_task_count: u32,
}

impl Worker {
    pub fn new<I: Into<WorkerId>, H: Into<String>>(id: I, host: H, port: u16) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            display_name: id.to_string(),
            id,
            address: WorkerAddress {
                host: host.into(),
                port,
            },
            username: String::new(),
            credential_ref: String::new(),
            capabilities: BTreeSet::new(),
            resources: ResourceSpec::default(),
            max_concurrent_tasks: 1,
            status: WorkerStatus::Active,
            health: HealthStatus::Healthy,
            last_heartbeat: now,
            registered_at: now,
            current_task_count: 0,
        }
    }

    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn free_slots(&self) -> u32 {
        self.max_concurrent_tasks
            .saturating_sub(self.current_task_count)
    }

    pub fn load_percentage(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            100.0
        } else {
            (self.current_task_count as f64 / self.max_concurrent_tasks as f64) * 100.0
        }
    }

    /// 是否可以接收新任务
    pub fn is_schedulable(&self) -> bool {
        self.status == WorkerStatus::Active
            && self.health != HealthStatus::Unhealthy
            && self.free_slots() > 0
    }

    pub fn can_accept(
        &self,
        required_capabilities: &BTreeSet<String>,
        min_resources: Option<&ResourceSpec>,
    ) -> bool {
        self.is_schedulable()
            && self.has_capabilities(required_capabilities)
            && min_resources.map_or(true, |min| self.resources.satisfies(min))
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}
