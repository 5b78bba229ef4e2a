use std::sync::Arc;

use anyhow::{Context, Result};
use devpool_core::{AppConfig, RemoteConfig};
use devpool_dispatcher::{Scheduler, SchedulerConfig};
use devpool_domain::{CheckpointStore, ResourceSpec, TaskExecutor, Worker};
use devpool_infrastructure::{FileCheckpointStore, InMemoryCheckpointStore, LoggingNotifier};
use devpool_worker::ShellExecutor;
use tokio::sync::broadcast;
use tracing::info;

/// 可选的执行通道
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// 在本机以子进程执行，只服务回环地址上的Worker
    Shell,
}

impl ExecutorKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "shell" => Ok(ExecutorKind::Shell),
            _ => Err(anyhow::anyhow!("不支持的执行通道: {name}")),
        }
    }

    pub fn create(&self) -> Arc<dyn TaskExecutor> {
        match self {
            ExecutorKind::Shell => Arc::new(ShellExecutor::new()),
        }
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    scheduler: Arc<Scheduler>,
}

impl Application {
    pub async fn new(config: AppConfig, executor: Arc<dyn TaskExecutor>) -> Result<Self> {
        info!("初始化应用程序，执行通道: {}", executor.name());

        let checkpoint_store: Arc<dyn CheckpointStore> = match config.checkpoint.directory {
            Some(ref directory) => Arc::new(
                FileCheckpointStore::new(directory)
                    .await
                    .with_context(|| format!("打开检查点目录失败: {directory}"))?,
            ),
            None => {
                info!("未配置检查点目录，检查点只保存在内存中");
                Arc::new(InMemoryCheckpointStore::new())
            }
        };

        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::from(&config),
            executor,
            Arc::new(LoggingNotifier::new()),
            checkpoint_store,
        ));

        Ok(Self { config, scheduler })
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// 注册配置中的Worker池，返回注册数量
    pub async fn register_pool(&self) -> Result<usize> {
        let workers = build_pool(&self.config.remote);
        let count = workers.len();

        for worker in workers {
            let id = worker.id.clone();
            self.scheduler
                .register_worker(worker)
                .await
                .with_context(|| format!("注册Worker失败: {id}"))?;
        }

        info!("已注册 {} 个Worker", count);
        Ok(count)
    }

    /// 运行调度器，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.register_pool().await?;
        self.scheduler.start().await.context("启动调度器失败")?;

        let _ = shutdown_rx.recv().await;
        info!("收到关闭信号，停止调度器");

        self.scheduler.shutdown().await;
        Ok(())
    }
}

/// 把 `[remote.pool.<name>]` 配置转换为Worker记录
pub fn build_pool(config: &RemoteConfig) -> Vec<Worker> {
    config
        .pool
        .iter()
        .map(|(name, entry)| {
            let mut worker = Worker::new(name.as_str(), entry.host.clone(), entry.port);
            worker.display_name = entry.display_name.clone().unwrap_or_else(|| name.clone());
            worker.username = entry.username.clone();
            worker.credential_ref = entry.key_ref.clone();
            worker.capabilities = entry.capabilities.iter().cloned().collect();
            worker.resources = ResourceSpec::new(
                entry.cpu_count,
                entry.memory_bytes,
                entry.accelerator_count,
            );
            worker.max_concurrent_tasks = entry.max_tasks.unwrap_or(config.max_tasks_per_worker);
            worker
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use devpool_domain::WorkerId;
    use devpool_testing_utils::MockExecutor;

    const POOL: &str = r#"
[remote]
enabled = true
max_tasks_per_worker = 3

[remote.pool.gpu-box]
host = "10.0.0.5"
username = "dev"
key_ref = "~/.ssh/gpu"
capabilities = ["code_generation", "testing"]
accelerator_count = 2
max_tasks = 1

[remote.pool.builder]
host = "127.0.0.1"
port = 2222
display_name = "本地构建机"
capabilities = ["refactoring"]
cpu_count = 8
"#;

    #[test]
    fn test_build_pool_from_config() {
        let config = AppConfig::from_toml(POOL).unwrap();
        let workers = build_pool(&config.remote);
        assert_eq!(workers.len(), 2);

        let builder = &workers[0];
        assert_eq!(builder.id, WorkerId::new("builder"));
        assert_eq!(builder.display_name, "本地构建机");
        assert_eq!(builder.address.port, 2222);
        assert_eq!(builder.max_concurrent_tasks, 3);
        assert_eq!(builder.resources.cpu_count, 8);

        let gpu = &workers[1];
        assert_eq!(gpu.display_name, "gpu-box");
        assert_eq!(gpu.credential_ref, "~/.ssh/gpu");
        assert_eq!(gpu.max_concurrent_tasks, 1);
        assert_eq!(gpu.resources.accelerator_count, 2);
        assert!(gpu.capabilities.contains("testing"));
    }

    #[test]
    fn test_executor_kind() {
        assert_eq!(ExecutorKind::parse("shell").unwrap(), ExecutorKind::Shell);
        assert!(ExecutorKind::parse("ssh").is_err());
        assert_eq!(ExecutorKind::Shell.create().name(), "shell");
    }

    #[tokio::test]
    async fn test_run_registers_pool_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::from_toml(POOL).unwrap();
        config.checkpoint.directory = Some(dir.path().to_string_lossy().to_string());

        let app = Arc::new(
            Application::new(config, Arc::new(MockExecutor::new()))
                .await
                .unwrap(),
        );
        let (tx, rx) = broadcast::channel(1);
        let handle = {
            let app = app.clone();
            tokio::spawn(async move { app.run(rx).await })
        };

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while app.scheduler().get_worker_stats().await.total_workers < 2 {
            assert!(std::time::Instant::now() < deadline, "Worker池未注册");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
