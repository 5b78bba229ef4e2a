use std::time::Duration;

use devpool_core::AppConfig;

use crate::health_monitor::HealthMonitorConfig;
use crate::retry_service::RetryConfig;

/// 调度器运行参数，由 [`AppConfig`] 换算而来
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    /// 全局同时执行的任务上限
    pub max_concurrent_tasks: usize,
    /// 单次执行的超时时间
    pub task_timeout: Duration,
    /// 没有唤醒通知时派发循环的轮询间隔
    pub poll_interval: Duration,
    /// 等待执行端确认取消的时间
    pub cancel_grace: Duration,
    /// 任务未指定时使用的最大重试次数
    pub default_max_retries: u32,
    pub max_retries_ceiling: u32,
    pub retry: RetryConfig,
    pub health: HealthMonitorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        let check_interval = Duration::from_secs(config.remote.health_check_interval_seconds);
        Self {
            queue_capacity: config.dispatcher.queue_capacity,
            max_concurrent_tasks: config.remote.max_concurrent_tasks,
            task_timeout: Duration::from_secs(config.remote.task_timeout_seconds),
            poll_interval: Duration::from_millis(config.dispatcher.poll_interval_ms),
            cancel_grace: Duration::from_secs(config.dispatcher.cancel_grace_seconds),
            default_max_retries: config.retry.default_max_retries,
            max_retries_ceiling: config.retry.max_retries_ceiling,
            retry: RetryConfig::from(&config.retry),
            health: HealthMonitorConfig {
                check_interval,
                heartbeat_miss_multiple: config.dispatcher.heartbeat_miss_multiple,
                active_probing: config.dispatcher.active_probing,
                probe_timeout: check_interval.min(Duration::from_secs(10)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_app_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.max_concurrent_tasks, 16);
        assert_eq!(config.task_timeout, Duration::from_secs(3600));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.retry.base_interval, Duration::from_secs(1));
        assert_eq!(config.health.check_interval, Duration::from_secs(30));
        assert_eq!(config.health.unreachable_after(), Duration::from_secs(90));
        assert_eq!(config.health.probe_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_conversion_from_toml() {
        let app = AppConfig::from_toml(
            r#"
[remote]
enabled = true
health_check_interval_seconds = 5
max_concurrent_tasks = 4
task_timeout_seconds = 120

[dispatcher]
queue_capacity = 50
heartbeat_miss_multiple = 4

[retry]
base_delay_ms = 250
"#,
        )
        .unwrap();

        let config = SchedulerConfig::from(&app);
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.task_timeout, Duration::from_secs(120));
        assert_eq!(config.retry.base_interval, Duration::from_millis(250));
        assert_eq!(config.health.unreachable_after(), Duration::from_secs(20));
        assert_eq!(config.health.probe_timeout, Duration::from_secs(5));
    }
}
