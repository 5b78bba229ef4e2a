use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::{TaskId, TaskPayload};

/// 任务检查点，只追加不覆盖，序号最大的为最新进度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: TaskId,
    /// 同一任务内单调递增，从1开始
    pub sequence: u64,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: TaskId, sequence: u64, payload: TaskPayload) -> Self {
        Self {
            task_id,
            sequence,
            payload,
            created_at: Utc::now(),
        }
    }
}
