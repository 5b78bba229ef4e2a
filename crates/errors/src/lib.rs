use thiserror::Error;


/// 调度器统一错误类型
///
/// 提交阶段的错误同步返回给调用方；执行阶段的错误记录在任务上，通过 `get_task` 可见。
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("检测到循环依赖: 任务 {task} 所在的依赖图存在环")]
    DependencyCycle { task: String },
    #[error("未知的依赖任务: 任务 {task} 依赖的任务 {dependency} 不存在")]
    UnknownDependency { task: String, dependency: String },
    #[error("依赖任务失败: 任务 {task} 依赖的任务 {dependency} 已终止")]
    DependencyFailed { task: String, dependency: String },
    #[error("没有可用的Worker支持任务类型: {task_type}")]
    NoCapableWorker { task_type: String },
    #[error("Worker不可达: {id}")]
    WorkerUnreachable { id: String },
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("重试次数已耗尽: 任务 {task} 共尝试 {attempts} 次，最后错误: {last_error}")]
    RetryExhausted {
        task: String,
        attempts: u32,
        last_error: String,
    },
    #[error("非法的状态转换: 任务 {task} 从 {from} 到 {to}")]
    InvalidStateTransition {
        task: String,
        from: String,
        to: String,
    },
    #[error("Worker已存在: {id}")]
    DuplicateWorker { id: String },
    #[error("Worker不存在: {id}")]
    WorkerNotFound { id: String },
    #[error("Worker已满载: {id}")]
    WorkerAtCapacity { id: String },
    #[error("任务不存在: {id}")]
    TaskNotFound { id: String },
    #[error("任务队列为空")]
    EmptyQueue,
    #[error("任务队列已满: 容量 {capacity}")]
    QueueFull { capacity: usize },
    #[error("任务 {task} 没有检查点")]
    NoCheckpoint { task: String },
    #[error("任务执行错误: {message}")]
    TaskExecution { message: String, retryable: bool },
    #[error("任务已取消: {0}")]
    Cancelled(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("IO错误: {0}")]
    Io(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn task_not_found<S: ToString>(id: S) -> Self {
        Self::TaskNotFound { id: id.to_string() }
    }
    pub fn worker_not_found<S: ToString>(id: S) -> Self {
        Self::WorkerNotFound { id: id.to_string() }
    }
    pub fn worker_unreachable<S: ToString>(id: S) -> Self {
        Self::WorkerUnreachable { id: id.to_string() }
    }
    pub fn no_checkpoint<S: ToString>(task: S) -> Self {
        Self::NoCheckpoint {
            task: task.to_string(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    /// 可重试的执行失败
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution {
            message: msg.into(),
            retryable: true,
        }
    }
    /// 不可重试的执行失败，任务会直接进入 Failed
    pub fn fatal_execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution {
            message: msg.into(),
            retryable: false,
        }
    }

    /// 执行阶段的错误是否允许按重试策略重新排队
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::TaskExecution { retryable, .. } => *retryable,
            SchedulerError::WorkerUnreachable { .. }
            | SchedulerError::Timeout(_)
            | SchedulerError::Io(_)
            | SchedulerError::Internal(_) => true,
            _ => false,
        }
    }

    /// 是否消耗任务的重试预算。NoCapableWorker 只会让任务留在队列中。
    pub fn counts_against_retry_budget(&self) -> bool {
        !matches!(self, SchedulerError::NoCapableWorker { .. }) && self.is_retryable()
    }

    /// 是否需要立即触发一次健康巡检
    pub fn triggers_health_sweep(&self) -> bool {
        matches!(
            self,
            SchedulerError::WorkerUnreachable { .. } | SchedulerError::Timeout(_)
        )
    }

    /// 提交阶段就能确定的错误，调用方不应重试
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::Validation(_)
                | SchedulerError::DependencyCycle { .. }
                | SchedulerError::UnknownDependency { .. }
                | SchedulerError::QueueFull { .. }
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::TaskNotFound { .. } => "请求的任务不存在",
            SchedulerError::WorkerNotFound { .. } => "请求的Worker节点不存在",
            SchedulerError::Validation(_) => "输入数据验证失败",
            SchedulerError::DependencyCycle { .. } => "任务依赖关系存在循环",
            SchedulerError::UnknownDependency { .. } => "任务依赖了不存在的任务",
            SchedulerError::QueueFull { .. } => "任务队列已满，请稍后重试",
            SchedulerError::Timeout(_) => "操作超时，请稍后重试",
            SchedulerError::WorkerUnreachable { .. } => "Worker节点不可达",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
