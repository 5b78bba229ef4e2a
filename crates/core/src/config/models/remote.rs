use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 远程Worker池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    /// 仅供环境准备组件使用，调度器本身不读取
    pub auto_install: bool,
    pub health_check_interval_seconds: u64,
    /// 全局并发执行上限
    pub max_concurrent_tasks: usize,
    /// Worker未单独声明 max_tasks 时的默认容量
    pub max_tasks_per_worker: u32,
    pub task_timeout_seconds: u64,
    pub pool: BTreeMap<String, PoolWorkerConfig>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_install: false,
            health_check_interval_seconds: 30,
            max_concurrent_tasks: 16,
            max_tasks_per_worker: 2,
            task_timeout_seconds: 3600,
            pool: BTreeMap::new(),
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.health_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("健康检查间隔必须大于0"));
        }

        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        if self.max_tasks_per_worker == 0 {
            return Err(anyhow::anyhow!("单个Worker的最大任务数必须大于0"));
        }

        if self.task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        for (name, worker) in &self.pool {
            worker
                .validate()
                .map_err(|e| anyhow::anyhow!("Worker池配置 {name} 无效: {e}"))?;
        }

        Ok(())
    }
}

/// 单个Worker的静态配置，对应 `[remote.pool.<name>]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolWorkerConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// 凭据引用（如密钥路径），原样传给执行通道
    #[serde(default)]
    pub key_ref: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub cpu_count: u32,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub accelerator_count: u32,
    #[serde(default)]
    pub max_tasks: Option<u32>,
}

fn default_ssh_port() -> u16 {
    22
}

impl PoolWorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow::anyhow!("主机地址不能为空"));
        }

        if self.port == 0 {
            return Err(anyhow::anyhow!("端口必须大于0"));
        }

        if self.capabilities.is_empty() {
            return Err(anyhow::anyhow!("能力标签不能为空"));
        }

        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(anyhow::anyhow!("能力标签不能包含空字符串"));
        }

        if self.max_tasks == Some(0) {
            return Err(anyhow::anyhow!("最大任务数必须大于0"));
        }

        Ok(())
    }
}
