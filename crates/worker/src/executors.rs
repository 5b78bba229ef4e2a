use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use devpool_domain::{
    CommandOutput, ExecutionOutcome, ExecutionRequest, TaskExecutor, TaskId, TaskPayload, Worker,
};
use devpool_errors::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// 标准输出最后一行以此开头时，视为任务交出阶段性进度，其后为JSON对象
pub const CHECKPOINT_MARKER: &str = "DEVPOOL_CHECKPOINT ";

const LOOPBACK_HOSTS: [&str; 3] = ["127.0.0.1", "localhost", "::1"];

/// Shell任务参数，从任务负载中解析
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// 非零退出码是否允许按重试策略重试
    #[serde(default = "default_retry_on_failure")]
    pub retry_on_failure: bool,
}

fn default_retry_on_failure() -> bool {
    true
}

impl ShellTaskParams {
    pub fn from_payload(payload: &TaskPayload) -> SchedulerResult<Self> {
        serde_json::from_value(payload.to_json()).map_err(|e| {
            SchedulerError::fatal_execution(format!("解析Shell任务参数失败: {e}"))
        })
    }
}

type ProcessTable = Arc<Mutex<HashMap<TaskId, (u32, u32)>>>;

/// 子进程登记，析构时移除，避免被中止的执行留下过期的pid
struct ProcessGuard {
    processes: ProcessTable,
    task_id: TaskId,
    attempt: u32,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut processes) = self.processes.lock() {
            if processes
                .get(&self.task_id)
                .is_some_and(|(attempt, _)| *attempt == self.attempt)
            {
                processes.remove(&self.task_id);
            }
        }
    }
}

/// Shell任务执行器
///
/// 只服务回环地址上的Worker；子进程设置了 `kill_on_drop`，调度器中止执行时进程随之结束。
pub struct ShellExecutor {
    /// 正在运行的任务: 任务ID -> (租约序号, 进程ID)
    running_processes: ProcessTable,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            running_processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 当前正在运行的子进程数
    pub fn running_count(&self) -> usize {
        self.running_processes
            .lock()
            .map(|processes| processes.len())
            .unwrap_or(0)
    }

    fn ensure_local(&self, worker: &Worker) -> SchedulerResult<()> {
        if LOOPBACK_HOSTS.contains(&worker.address.host.as_str()) {
            Ok(())
        } else {
            Err(SchedulerError::worker_unreachable(&worker.id))
        }
    }

    fn track(&self, task_id: TaskId, attempt: u32, pid: Option<u32>) -> ProcessGuard {
        if let Some(pid) = pid {
            if let Ok(mut processes) = self.running_processes.lock() {
                processes.insert(task_id, (attempt, pid));
            }
        }
        ProcessGuard {
            processes: Arc::clone(&self.running_processes),
            task_id,
            attempt,
        }
    }

    fn build_command(&self, params: &ShellTaskParams, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("DEVPOOL_TASK_ID", request.task_id.to_string())
            .env("DEVPOOL_ATTEMPT", request.attempt.to_string())
            .env("DEVPOOL_WORKER_ID", request.worker.id.as_str());

        if let Some(ref dir) = params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &params.env_vars {
            cmd.env(key, value);
        }
        if let Some(ref checkpoint) = request.checkpoint {
            cmd.env("DEVPOOL_CHECKPOINT_SEQ", checkpoint.sequence.to_string());
            cmd.env("DEVPOOL_CHECKPOINT", checkpoint.payload.to_json().to_string());
        }
        cmd
    }

    fn interpret(
        &self,
        params: &ShellTaskParams,
        output: Output,
        elapsed_ms: u64,
    ) -> SchedulerResult<ExecutionOutcome> {
        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        let Some(exit_code) = output.status.code() else {
            return Err(SchedulerError::execution(format!(
                "命令 {} 被信号终止",
                params.command
            )));
        };

        if !output.status.success() {
            let message = if stderr.is_empty() {
                format!("命令执行失败，退出码: {exit_code}")
            } else {
                format!("命令执行失败，退出码: {exit_code}，错误输出: {stderr}")
            };
            return Err(if params.retry_on_failure {
                SchedulerError::execution(message)
            } else {
                SchedulerError::fatal_execution(message)
            });
        }

        let (body, marker) = match stdout.rsplit_once('\n') {
            Some((head, last)) if last.starts_with(CHECKPOINT_MARKER) => (head, Some(last)),
            None if stdout.starts_with(CHECKPOINT_MARKER) => ("", Some(stdout.as_str())),
            _ => (stdout.as_str(), None),
        };

        if let Some(line) = marker {
            let json = serde_json::from_str(&line[CHECKPOINT_MARKER.len()..]).map_err(|e| {
                SchedulerError::fatal_execution(format!("解析检查点输出失败: {e}"))
            })?;
            let progress = TaskPayload::from_json(json)
                .map_err(|e| SchedulerError::fatal_execution(e.to_string()))?;
            return Ok(ExecutionOutcome::Yielded { progress });
        }

        let output = TaskPayload::new()
            .with("exit_code", i64::from(exit_code))
            .with("stdout", body)
            .with("stderr", stderr)
            .with("duration_ms", elapsed_ms as i64);
        Ok(ExecutionOutcome::Completed { output })
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn kill_command(pid: u32) -> Command {
    let mut cmd = Command::new("kill");
    cmd.arg(pid.to_string());
    cmd
}

#[cfg(windows)]
fn kill_command(pid: u32) -> Command {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/F"]);
    cmd
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.args(["-c", command]);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", command]);
    cmd
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    async fn execute(&self, request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        self.ensure_local(&request.worker)?;
        let params = ShellTaskParams::from_payload(&request.payload)?;
        let start_time = Instant::now();

        info!(
            "执行Shell任务: task_id={}, attempt={}, worker={}, command={}, args={:?}",
            request.task_id, request.attempt, request.worker.id, params.command, params.args
        );

        let child = self
            .build_command(&params, &request)
            .spawn()
            .map_err(|e| {
                let message = format!("启动Shell命令 {} 失败: {e}", params.command);
                if e.kind() == std::io::ErrorKind::NotFound {
                    SchedulerError::fatal_execution(message)
                } else {
                    SchedulerError::execution(message)
                }
            })?;

        let _guard = self.track(request.task_id, request.attempt, child.id());
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SchedulerError::execution(format!("等待进程结束失败: {e}")))?;

        let elapsed_ms = start_time.elapsed().as_millis() as u64;
        let outcome = self.interpret(&params, output, elapsed_ms);

        match &outcome {
            Ok(ExecutionOutcome::Completed { .. }) => info!(
                "Shell任务执行完成: task_id={}, duration={}ms",
                request.task_id, elapsed_ms
            ),
            Ok(ExecutionOutcome::Yielded { .. }) => debug!(
                "Shell任务交出进度: task_id={}, duration={}ms",
                request.task_id, elapsed_ms
            ),
            Err(e) => warn!("Shell任务执行失败: task_id={}, error={}", request.task_id, e),
        }
        outcome
    }

    async fn probe(&self, worker: &Worker) -> SchedulerResult<()> {
        self.ensure_local(worker)
    }

    async fn run_command(&self, worker: &Worker, command: &str) -> SchedulerResult<CommandOutput> {
        self.ensure_local(worker)?;

        let output = shell_command(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }

    async fn cancel(&self, _worker: &Worker, task_id: TaskId) -> SchedulerResult<bool> {
        let pid = self
            .running_processes
            .lock()
            .ok()
            .and_then(|processes| processes.get(&task_id).map(|(_, pid)| *pid));

        let Some(pid) = pid else {
            warn!("未找到要取消的Shell任务: task_id={}", task_id);
            return Ok(false);
        };

        let output = kill_command(pid).output().await.map_err(|e| {
            error!("执行kill命令失败: task_id={}, pid={}, error={}", task_id, pid, e);
            SchedulerError::from(e)
        })?;

        if output.status.success() {
            info!("成功取消Shell任务: task_id={}, pid={}", task_id, pid);
            Ok(true)
        } else {
            error!(
                "取消Shell任务失败: task_id={}, pid={}, error={}",
                task_id,
                pid,
                String::from_utf8_lossy(&output.stderr)
            );
            Ok(false)
        }
    }

    fn name(&self) -> &str {
        "shell"
    }
}
