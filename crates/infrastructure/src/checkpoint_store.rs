use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use devpool_domain::{Checkpoint, CheckpointStore, TaskId};
use devpool_errors::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// 内存检查点存储，调度器重启后进度丢失
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<TaskId, Vec<Checkpoint>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(&self, checkpoint: Checkpoint) -> SchedulerResult<()> {
        let mut checkpoints = self.checkpoints.write().await;
        let entries = checkpoints.entry(checkpoint.task_id).or_default();
        if let Some(last) = entries.last() {
            if checkpoint.sequence <= last.sequence {
                return Err(SchedulerError::validation_error(format!(
                    "检查点序号必须递增: 任务 {} 当前 {}，收到 {}",
                    checkpoint.task_id, last.sequence, checkpoint.sequence
                )));
            }
        }
        entries.push(checkpoint);
        Ok(())
    }

    async fn latest(&self, task_id: TaskId) -> SchedulerResult<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints
            .get(&task_id)
            .and_then(|entries| entries.last().cloned()))
    }

    async fn list(&self, task_id: TaskId) -> SchedulerResult<Vec<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(&task_id).cloned().unwrap_or_default())
    }
}

/// 基于文件的检查点存储
///
/// 目录结构为 `<root>/<task_id>/<sequence>.json`，每个检查点一个文件，
/// 先写临时文件再重命名，读到的文件总是完整的。
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new<P: AsRef<Path>>(root: P) -> SchedulerResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        debug!("检查点目录: {}", root.display());
        Ok(Self { root })
    }

    fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.root.join(task_id.to_string())
    }

    fn checkpoint_path(&self, task_id: TaskId, sequence: u64) -> PathBuf {
        self.task_dir(task_id).join(format!("{sequence:020}.json"))
    }

    /// 按序号升序列出任务目录下的检查点序号
    async fn sequences(&self, task_id: TaskId) -> SchedulerResult<Vec<u64>> {
        let dir = self.task_dir(task_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sequences = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(seq) => sequences.push(seq),
                None => warn!("忽略无法识别的检查点文件: {}", path.display()),
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    async fn read_checkpoint(&self, task_id: TaskId, sequence: u64) -> SchedulerResult<Checkpoint> {
        let bytes = tokio::fs::read(self.checkpoint_path(task_id, sequence)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn append(&self, checkpoint: Checkpoint) -> SchedulerResult<()> {
        let task_id = checkpoint.task_id;
        if let Some(last) = self.sequences(task_id).await?.last() {
            if checkpoint.sequence <= *last {
                return Err(SchedulerError::validation_error(format!(
                    "检查点序号必须递增: 任务 {} 当前 {}，收到 {}",
                    task_id, last, checkpoint.sequence
                )));
            }
        }

        tokio::fs::create_dir_all(self.task_dir(task_id)).await?;
        let path = self.checkpoint_path(task_id, checkpoint.sequence);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&checkpoint)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        metrics::counter!("devpool_checkpoints_written_total").increment(1);
        debug!(
            "检查点已写入: 任务 {} 序号 {} -> {}",
            task_id,
            checkpoint.sequence,
            path.display()
        );
        Ok(())
    }

    async fn latest(&self, task_id: TaskId) -> SchedulerResult<Option<Checkpoint>> {
        match self.sequences(task_id).await?.last() {
            Some(seq) => Ok(Some(self.read_checkpoint(task_id, *seq).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, task_id: TaskId) -> SchedulerResult<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        for seq in self.sequences(task_id).await? {
            checkpoints.push(self.read_checkpoint(task_id, seq).await?);
        }
        Ok(checkpoints)
    }
}
