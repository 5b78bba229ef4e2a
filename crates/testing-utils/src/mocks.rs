//! 端口trait的内存Mock实现
//!
//! `MockExecutor` 按任务类型编排执行结果，并记录每一次调用，
//! 测试不需要真实的远程Worker。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devpool_domain::{
    CommandOutput, ExecutionOutcome, ExecutionRequest, TaskExecutor, TaskId, TaskNotifier,
    TaskPayload, TaskView, Worker, WorkerId,
};
use devpool_errors::{SchedulerError, SchedulerResult};

/// 一次执行的预设结果
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Complete(TaskPayload),
    Yield(TaskPayload),
    Fail(SchedulerError),
    /// 一直挂起，直到执行被中止
    Hang,
    /// 等待一段时间后成功
    Delay(Duration),
}

/// 被记录下来的执行请求
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExecution {
    pub task_id: TaskId,
    pub attempt: u32,
    pub worker_id: WorkerId,
    pub task_type: String,
    pub checkpoint_sequence: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MockExecutor {
    scripts: Arc<Mutex<HashMap<String, VecDeque<MockOutcome>>>>,
    executions: Arc<Mutex<Vec<RecordedExecution>>>,
    unreachable: Arc<Mutex<HashSet<WorkerId>>>,
    cancellations: Arc<Mutex<Vec<TaskId>>>,
    command_delay: Arc<Mutex<Option<Duration>>>,
    cancel_ack: Arc<AtomicBool>,
    probes: Arc<AtomicUsize>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(Mutex::new(HashMap::new())),
            executions: Arc::new(Mutex::new(Vec::new())),
            unreachable: Arc::new(Mutex::new(HashSet::new())),
            cancellations: Arc::new(Mutex::new(Vec::new())),
            command_delay: Arc::new(Mutex::new(None)),
            cancel_ack: Arc::new(AtomicBool::new(true)),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 为某个任务类型追加预设结果，用完后默认成功
    pub fn script(&self, task_type: &str, outcomes: Vec<MockOutcome>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(task_type.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn set_unreachable(&self, worker_id: &str, unreachable: bool) {
        let mut workers = self.unreachable.lock().unwrap();
        if unreachable {
            workers.insert(WorkerId::new(worker_id));
        } else {
            workers.remove(&WorkerId::new(worker_id));
        }
    }

    pub fn set_cancel_ack(&self, ack: bool) {
        self.cancel_ack.store(ack, Ordering::SeqCst);
    }

    pub fn set_command_delay(&self, delay: Duration) {
        *self.command_delay.lock().unwrap() = Some(delay);
    }

    pub fn executions(&self) -> Vec<RecordedExecution> {
        self.executions.lock().unwrap().clone()
    }

    pub fn executions_of(&self, task_id: TaskId) -> Vec<RecordedExecution> {
        self.executions()
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect()
    }

    pub fn cancellations(&self) -> Vec<TaskId> {
        self.cancellations.lock().unwrap().clone()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn is_unreachable(&self, worker_id: &WorkerId) -> bool {
        self.unreachable.lock().unwrap().contains(worker_id)
    }

    fn next_outcome(&self, task_type: &str) -> MockOutcome {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(task_type)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| MockOutcome::Complete(TaskPayload::new()))
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute(&self, request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        self.executions.lock().unwrap().push(RecordedExecution {
            task_id: request.task_id,
            attempt: request.attempt,
            worker_id: request.worker.id.clone(),
            task_type: request.task_type.clone(),
            checkpoint_sequence: request.checkpoint.as_ref().map(|c| c.sequence),
        });

        if self.is_unreachable(&request.worker.id) {
            return Err(SchedulerError::worker_unreachable(&request.worker.id));
        }

        match self.next_outcome(&request.task_type) {
            MockOutcome::Complete(output) => Ok(ExecutionOutcome::Completed { output }),
            MockOutcome::Yield(progress) => Ok(ExecutionOutcome::Yielded { progress }),
            MockOutcome::Fail(error) => Err(error),
            MockOutcome::Hang => std::future::pending().await,
            MockOutcome::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ExecutionOutcome::Completed {
                    output: TaskPayload::new(),
                })
            }
        }
    }

    async fn probe(&self, worker: &Worker) -> SchedulerResult<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.is_unreachable(&worker.id) {
            return Err(SchedulerError::worker_unreachable(&worker.id));
        }
        Ok(())
    }

    async fn run_command(&self, worker: &Worker, command: &str) -> SchedulerResult<CommandOutput> {
        if self.is_unreachable(&worker.id) {
            return Err(SchedulerError::worker_unreachable(&worker.id));
        }
        let delay = *self.command_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(CommandOutput {
            exit_code: 0,
            stdout: format!("{command}@{}", worker.id),
            stderr: String::new(),
        })
    }

    async fn cancel(&self, _worker: &Worker, task_id: TaskId) -> SchedulerResult<bool> {
        self.cancellations.lock().unwrap().push(task_id);
        Ok(self.cancel_ack.load(Ordering::SeqCst))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 记录所有失败通知
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    failures: Arc<Mutex<Vec<(TaskId, String)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<(TaskId, String)> {
        self.failures.lock().unwrap().clone()
    }

    pub fn count_for(&self, task_id: TaskId) -> usize {
        self.failures
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == task_id)
            .count()
    }
}

#[async_trait]
impl TaskNotifier for RecordingNotifier {
    async fn task_failed(&self, task: &TaskView, reason: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((task.id, reason.to_string()));
    }
}
