use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use chrono::{DateTime, Utc};
use devpool_domain::{Task, TaskId};
use devpool_errors::{SchedulerError, SchedulerResult};
use tokio::sync::Mutex;
use tracing::debug;

/// 队列条目，排序字段在入队时从任务上复制
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub score: i64,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
}

impl From<&Task> for QueueEntry {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            score: task.dispatch_score(),
            created_at: task.created_at,
            sequence: task.sequence,
        }
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // 分数高的优先，同分时先创建、先提交的优先
        self.score
            .cmp(&other.score)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    /// 当前有效的任务，取消时只从这里删除，堆中的旧条目在出队时跳过
    queued: HashSet<TaskId>,
}

impl QueueState {
    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.queued.contains(&top.task_id) {
                break;
            }
            self.heap.pop();
        }
    }

    fn insert(&mut self, entry: QueueEntry) -> bool {
        if !self.queued.insert(entry.task_id) {
            return false;
        }
        self.heap.push(entry);
        true
    }
}

/// 按关键度与优先级排序的就绪任务队列
#[derive(Debug)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 新任务入队，超出容量返回 `QueueFull`；已在队列中的任务不会重复入队
    pub async fn push(&self, entry: QueueEntry) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if state.queued.contains(&entry.task_id) {
            return Ok(());
        }
        if state.queued.len() >= self.capacity {
            return Err(SchedulerError::QueueFull {
                capacity: self.capacity,
            });
        }
        state.insert(entry);
        metrics::gauge!("devpool_queue_depth").set(state.queued.len() as f64);
        Ok(())
    }

    /// 已被接纳的任务重新入队（依赖就绪、重试、回收），不受容量限制
    pub async fn push_admitted(&self, entry: QueueEntry) {
        let mut state = self.state.lock().await;
        let task_id = entry.task_id;
        if !state.insert(entry) {
            debug!("任务 {} 已在队列中，忽略重复入队", task_id);
        }
        metrics::gauge!("devpool_queue_depth").set(state.queued.len() as f64);
    }

    /// 本轮没有可用Worker的任务原样放回
    pub async fn requeue(&self, entry: QueueEntry) {
        self.push_admitted(entry).await;
    }

    pub async fn pop_highest(&self) -> SchedulerResult<QueueEntry> {
        let mut state = self.state.lock().await;
        state.discard_stale();
        let entry = state.heap.pop().ok_or(SchedulerError::EmptyQueue)?;
        state.queued.remove(&entry.task_id);
        metrics::gauge!("devpool_queue_depth").set(state.queued.len() as f64);
        Ok(entry)
    }

    pub async fn peek(&self) -> Option<QueueEntry> {
        let mut state = self.state.lock().await;
        state.discard_stale();
        state.heap.peek().cloned()
    }

    /// 取消时移除任务，返回任务是否在队列中
    pub async fn remove(&self, task_id: &TaskId) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.queued.remove(task_id);
        if removed {
            metrics::gauge!("devpool_queue_depth").set(state.queued.len() as f64);
        }
        removed
    }

    pub async fn contains(&self, task_id: &TaskId) -> bool {
        self.state.lock().await.queued.contains(task_id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queued.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.queued.is_empty()
    }

    pub async fn remaining_capacity(&self) -> usize {
        let state = self.state.lock().await;
        self.capacity.saturating_sub(state.queued.len())
    }
}
