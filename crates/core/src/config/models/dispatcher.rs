use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    /// 没有Worker可用通知时的轮询间隔
    pub poll_interval_ms: u64,
    /// 心跳超过 健康检查间隔 × 该倍数 即判定不可达
    pub heartbeat_miss_multiple: u32,
    pub cancel_grace_seconds: u64,
    /// 巡检时是否通过执行器主动探测Worker
    pub active_probing: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            poll_interval_ms: 500,
            heartbeat_miss_multiple: 3,
            cancel_grace_seconds: 10,
            active_probing: true,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            return Err(anyhow::anyhow!("队列容量必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("调度轮询间隔必须大于0"));
        }

        if self.heartbeat_miss_multiple < 2 {
            return Err(anyhow::anyhow!(
                "心跳丢失倍数必须至少为2，当前: {}",
                self.heartbeat_miss_multiple
            ));
        }

        Ok(())
    }
}

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 提交时未指定 max_retries 的默认值
    pub default_max_retries: u32,
    pub max_retries_ceiling: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            default_max_retries: 3,
            max_retries_ceiling: 10,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow::anyhow!(
                "最大重试间隔 {}ms 不能小于基础间隔 {}ms",
                self.max_delay_ms,
                self.base_delay_ms
            ));
        }

        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1.0"));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动因子必须在0.0到1.0之间"));
        }

        if self.default_max_retries > self.max_retries_ceiling {
            return Err(anyhow::anyhow!(
                "默认重试次数 {} 超过上限 {}",
                self.default_max_retries,
                self.max_retries_ceiling
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// 检查点目录，未配置时只保存在内存中
    pub directory: Option<String>,
}

impl CheckpointConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(dir) = &self.directory {
            if dir.trim().is_empty() {
                return Err(anyhow::anyhow!("检查点目录不能为空字符串"));
            }
        }
        Ok(())
    }
}
