use std::collections::HashMap;

use devpool_domain::TaskId;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::debug;

/// 正在执行的任务句柄，按 (任务, 租约序号) 记录
#[derive(Debug, Default)]
pub struct InFlightTracker {
    handles: Mutex<HashMap<TaskId, (u32, AbortHandle)>>,
}

pub type InFlightGuard<'a> = MutexGuard<'a, HashMap<TaskId, (u32, AbortHandle)>>;

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 持有锁期间启动执行，执行结束时的 `finish` 一定发生在登记之后
    pub async fn lock(&self) -> InFlightGuard<'_> {
        self.handles.lock().await
    }

    /// 执行正常结束后移除登记，租约已更新时不动新的句柄
    pub async fn finish(&self, task_id: TaskId, attempt: u32) {
        let mut handles = self.handles.lock().await;
        if matches!(handles.get(&task_id), Some((current, _)) if *current == attempt) {
            handles.remove(&task_id);
        }
    }

    /// 中止指定租约的执行
    pub async fn abort(&self, task_id: TaskId, attempt: u32) -> bool {
        let mut handles = self.handles.lock().await;
        match handles.get(&task_id) {
            Some((current, handle)) if *current == attempt => {
                handle.abort();
                handles.remove(&task_id);
                debug!("中止任务 {} 的第 {} 次执行", task_id, attempt);
                true
            }
            _ => false,
        }
    }

    pub async fn abort_all(&self) -> usize {
        let mut handles = self.handles.lock().await;
        let count = handles.len();
        for (_, (_, handle)) in handles.drain() {
            handle.abort();
        }
        count
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }
}
