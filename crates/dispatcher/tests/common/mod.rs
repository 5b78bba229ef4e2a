#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use devpool_dispatcher::{HealthMonitorConfig, RetryConfig, Scheduler, SchedulerConfig};
use devpool_domain::{TaskId, TaskStatus, TaskView, WorkerId};
use devpool_infrastructure::InMemoryCheckpointStore;
use devpool_testing_utils::{MockExecutor, RecordingNotifier, WorkerBuilder};

pub struct TestScheduler {
    pub scheduler: Scheduler,
    pub executor: MockExecutor,
    pub notifier: RecordingNotifier,
}

/// 快速重试、慢速巡检，后台循环运行时不会误判Worker失效
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(10),
        cancel_grace: Duration::from_millis(100),
        retry: RetryConfig {
            base_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        },
        health: HealthMonitorConfig {
            check_interval: Duration::from_secs(60),
            heartbeat_miss_multiple: 3,
            active_probing: false,
            probe_timeout: Duration::from_millis(100),
        },
        ..SchedulerConfig::default()
    }
}

/// 心跳阈值很短的配置，只用于手动触发巡检的测试
pub fn short_heartbeat_config() -> SchedulerConfig {
    SchedulerConfig {
        health: HealthMonitorConfig {
            check_interval: Duration::from_millis(40),
            heartbeat_miss_multiple: 2,
            active_probing: false,
            probe_timeout: Duration::from_millis(40),
        },
        ..test_config()
    }
}

pub fn build(config: SchedulerConfig) -> TestScheduler {
    let executor = MockExecutor::new();
    let notifier = RecordingNotifier::new();
    let scheduler = Scheduler::new(
        config,
        Arc::new(executor.clone()),
        Arc::new(notifier.clone()),
        Arc::new(InMemoryCheckpointStore::new()),
    );
    TestScheduler {
        scheduler,
        executor,
        notifier,
    }
}

pub async fn add_worker(scheduler: &Scheduler, id: &str, max_tasks: u32) {
    scheduler
        .register_worker(WorkerBuilder::new(id).with_max_tasks(max_tasks).build())
        .await
        .unwrap();
}

pub async fn wait_for_status(scheduler: &Scheduler, task_id: TaskId, status: TaskStatus) -> TaskView {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let task = scheduler.get_task(task_id).await.unwrap();
        if task.status == status {
            return task;
        }
        assert!(
            Instant::now() < deadline,
            "任务 {} 未在期限内进入 {}，当前状态 {}",
            task_id,
            status,
            task.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 反复派发直到启动了一个任务
pub async fn dispatch_one(scheduler: &Scheduler) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if scheduler.dispatch_now().await.unwrap() == 1 {
            return;
        }
        assert!(Instant::now() < deadline, "没有任务被派发");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_until_idle(scheduler: &Scheduler) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while scheduler.in_flight_count().await > 0 {
        assert!(Instant::now() < deadline, "执行中的任务未在期限内结束");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn keep_alive(scheduler: &Scheduler, ids: &[&str]) {
    for id in ids {
        scheduler
            .record_heartbeat(&WorkerId::new(*id))
            .await
            .unwrap();
    }
}
