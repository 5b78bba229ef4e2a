use std::collections::{BTreeMap, HashMap, HashSet};

use devpool_domain::{Task, TaskId, TaskStatus, WorkerId};
use devpool_errors::{SchedulerError, SchedulerResult};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// 任务表，任务记录从不删除
///
/// 所有修改都经过 [`TaskTable::update`]，以保证状态索引和Worker索引与记录一致。
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    /// 依赖 -> 直接下游
    dependents: HashMap<TaskId, Vec<TaskId>>,
    by_status: BTreeMap<TaskStatus, HashSet<TaskId>>,
    by_worker: HashMap<WorkerId, HashSet<TaskId>>,
    next_sequence: u64,
}

impl TaskTable {
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// 分配下一个提交序号
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    pub fn insert(&mut self, task: Task) {
        for dependency in &task.dependencies {
            self.dependents.entry(*dependency).or_default().push(task.id);
        }
        self.index(&task);
        self.tasks.insert(task.id, task);
    }

    /// 在任务副本上执行修改，成功后才写回，失败时任务保持原样
    pub fn update<R, F>(&mut self, id: &TaskId, f: F) -> SchedulerResult<R>
    where
        F: FnOnce(&mut Task) -> SchedulerResult<R>,
    {
        let current = self
            .tasks
            .get(id)
            .ok_or_else(|| SchedulerError::task_not_found(id))?;
        let mut updated = current.clone();
        let result = f(&mut updated)?;

        if current.status != updated.status || current.assigned_worker != updated.assigned_worker
        {
            let previous = current.clone();
            self.unindex(&previous);
            self.index(&updated);
        }
        self.tasks.insert(*id, updated);
        Ok(result)
    }

    pub fn dependents_of(&self, id: &TaskId) -> &[TaskId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.by_status
            .get(&status)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 分配在该Worker上且仍在执行中的任务
    pub fn in_flight_on(&self, worker: &WorkerId) -> Vec<TaskId> {
        self.by_worker
            .get(worker)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        self.tasks
                            .get(id)
                            .is_some_and(|t| t.status.is_in_flight())
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        self.by_status
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(status, ids)| (*status, ids.len()))
            .collect()
    }

    fn index(&mut self, task: &Task) {
        self.by_status.entry(task.status).or_default().insert(task.id);
        if let Some(worker) = &task.assigned_worker {
            self.by_worker
                .entry(worker.clone())
                .or_default()
                .insert(task.id);
        }
    }

    fn unindex(&mut self, task: &Task) {
        if let Some(ids) = self.by_status.get_mut(&task.status) {
            ids.remove(&task.id);
        }
        if let Some(worker) = &task.assigned_worker {
            if let Some(ids) = self.by_worker.get_mut(worker) {
                ids.remove(&task.id);
                if ids.is_empty() {
                    self.by_worker.remove(worker);
                }
            }
        }
    }
}

/// 任务存储
#[derive(Debug, Default)]
pub struct TaskStore {
    table: RwLock<TaskTable>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, TaskTable> {
        self.table.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, TaskTable> {
        self.table.write().await
    }

    pub async fn get(&self, id: &TaskId) -> SchedulerResult<Task> {
        self.table
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::task_not_found(id))
    }

    pub async fn update<R, F>(&self, id: &TaskId, f: F) -> SchedulerResult<R>
    where
        F: FnOnce(&mut Task) -> SchedulerResult<R>,
    {
        self.table.write().await.update(id, f)
    }

    /// 按提交顺序返回任务，可按状态过滤
    pub async fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let table = self.table.read().await;
        let mut tasks: Vec<Task> = match status {
            Some(status) => table
                .ids_with_status(status)
                .iter()
                .filter_map(|id| table.get(id).cloned())
                .collect(),
            None => table.iter().cloned().collect(),
        };
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.read().await.is_empty()
    }

    pub async fn count_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        self.table.read().await.count_by_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpool_domain::TaskPayload;

    fn new_task(table: &mut TaskTable, deps: Vec<TaskId>) -> TaskId {
        let seq = table.next_sequence();
        let mut task = Task::new("testing", TaskPayload::new(), seq);
        task.dependencies = deps;
        let id = task.id;
        table.insert(task);
        id
    }

    #[tokio::test]
    async fn test_status_index_follows_updates() {
        let store = TaskStore::new();
        let id = {
            let mut table = store.write().await;
            new_task(&mut table, vec![])
        };

        assert_eq!(
            store.read().await.ids_with_status(TaskStatus::Pending),
            vec![id]
        );

        store
            .update(&id, |t| t.transition_to(TaskStatus::Queued, None))
            .await
            .unwrap();

        let table = store.read().await;
        assert!(table.ids_with_status(TaskStatus::Pending).is_empty());
        assert_eq!(table.ids_with_status(TaskStatus::Queued), vec![id]);
        assert_eq!(table.count_by_status().get(&TaskStatus::Queued), Some(&1));
        assert_eq!(table.count_by_status().get(&TaskStatus::Pending), None);
    }

    #[tokio::test]
    async fn test_failed_update_leaves_task_untouched() {
        let store = TaskStore::new();
        let id = {
            let mut table = store.write().await;
            new_task(&mut table, vec![])
        };

        let result = store
            .update(&id, |t| {
                t.retry_count = 99;
                t.transition_to(TaskStatus::Completed, None)
            })
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidStateTransition { .. })
        ));

        let task = store.get(&id).await.unwrap();
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_worker_index_tracks_in_flight_tasks() {
        let store = TaskStore::new();
        let worker = WorkerId::new("w1");
        let id = {
            let mut table = store.write().await;
            new_task(&mut table, vec![])
        };

        store
            .update(&id, |t| {
                t.transition_to(TaskStatus::Queued, None)?;
                t.transition_to(TaskStatus::Assigned, None)?;
                t.assigned_worker = Some(worker.clone());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.read().await.in_flight_on(&worker), vec![id]);

        store
            .update(&id, |t| {
                t.transition_to(TaskStatus::Running, None)?;
                t.transition_to(TaskStatus::Completed, None)?;
                t.assigned_worker = None;
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.read().await.in_flight_on(&worker).is_empty());
    }

    #[tokio::test]
    async fn test_dependents_index() {
        let store = TaskStore::new();
        let mut table = store.write().await;
        let a = new_task(&mut table, vec![]);
        let b = new_task(&mut table, vec![a]);
        let c = new_task(&mut table, vec![a, b]);

        assert_eq!(table.dependents_of(&a), &[b, c]);
        assert_eq!(table.dependents_of(&b), &[c]);
        assert!(table.dependents_of(&c).is_empty());
    }

    #[tokio::test]
    async fn test_list_in_submission_order() {
        let store = TaskStore::new();
        let ids = {
            let mut table = store.write().await;
            (0..5)
                .map(|_| new_task(&mut table, vec![]))
                .collect::<Vec<_>>()
        };

        let listed: Vec<TaskId> = store.list(None).await.iter().map(|t| t.id).collect();
        assert_eq!(listed, ids);
        assert_eq!(store.list(Some(TaskStatus::Pending)).await.len(), 5);
        assert!(store.list(Some(TaskStatus::Running)).await.is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_task() {
        let store = TaskStore::new();
        assert!(matches!(
            store.get(&TaskId::new()).await,
            Err(SchedulerError::TaskNotFound { .. })
        ));
    }
}
