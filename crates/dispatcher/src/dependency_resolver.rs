use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use devpool_domain::{Task, TaskId, TaskNotifier, TaskStatus, TaskView};
use devpool_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, info, warn};

use crate::priority_queue::{QueueEntry, TaskQueue};
use crate::task_store::{TaskStore, TaskTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    InProgress,
    Done,
}

/// 在现有依赖图加上新批次的边之后做DFS，返回环上的某个任务
pub fn find_cycle(table: &TaskTable, batch: &[Task]) -> Option<TaskId> {
    let batch_edges: HashMap<TaskId, &[TaskId]> = batch
        .iter()
        .map(|t| (t.id, t.dependencies.as_slice()))
        .collect();
    let mut states = HashMap::new();

    batch
        .iter()
        .find_map(|task| visit(task.id, table, &batch_edges, &mut states))
}

fn visit(
    node: TaskId,
    table: &TaskTable,
    batch_edges: &HashMap<TaskId, &[TaskId]>,
    states: &mut HashMap<TaskId, VisitState>,
) -> Option<TaskId> {
    match states.get(&node) {
        Some(VisitState::InProgress) => return Some(node),
        Some(VisitState::Done) => return None,
        None => {}
    }
    states.insert(node, VisitState::InProgress);

    let edges: Vec<TaskId> = match batch_edges.get(&node) {
        Some(deps) => deps.to_vec(),
        None => table
            .get(&node)
            .map(|t| t.dependencies.clone())
            .unwrap_or_default(),
    };
    for dependency in edges {
        if let Some(on_cycle) = visit(dependency, table, batch_edges, states) {
            return Some(on_cycle);
        }
    }

    states.insert(node, VisitState::Done);
    None
}

/// 依赖解析器
///
/// 负责新任务的接纳校验，以及上游完成或失败后推进下游任务。
pub struct DependencyResolver {
    store: Arc<TaskStore>,
    queue: Arc<TaskQueue>,
    notifier: Arc<dyn TaskNotifier>,
}

impl DependencyResolver {
    pub fn new(
        store: Arc<TaskStore>,
        queue: Arc<TaskQueue>,
        notifier: Arc<dyn TaskNotifier>,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
        }
    }

    /// 校验并接纳一批任务，任何一项失败则整批都不写入
    ///
    /// 依赖全部已完成的任务直接进入 Queued，其余保持 Pending。
    pub async fn admit_batch(&self, mut tasks: Vec<Task>) -> SchedulerResult<Vec<TaskId>> {
        let mut table = self.store.write().await;
        let batch_ids: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();

        for task in &tasks {
            for dependency in &task.dependencies {
                if batch_ids.contains(dependency) {
                    continue;
                }
                match table.get(dependency) {
                    None => {
                        return Err(SchedulerError::UnknownDependency {
                            task: task.id.to_string(),
                            dependency: dependency.to_string(),
                        })
                    }
                    Some(upstream)
                        if matches!(
                            upstream.status,
                            TaskStatus::Failed | TaskStatus::Cancelled
                        ) =>
                    {
                        return Err(SchedulerError::validation_error(format!(
                            "依赖任务 {} 已处于终止状态 {}，任务永远无法执行",
                            dependency, upstream.status
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        if let Some(on_cycle) = find_cycle(&table, &tasks) {
            warn!("拒绝提交: 任务 {} 处于依赖环中", on_cycle);
            return Err(SchedulerError::DependencyCycle {
                task: on_cycle.to_string(),
            });
        }

        let is_ready = |task: &Task| {
            task.dependencies.iter().all(|dep| {
                !batch_ids.contains(dep)
                    && table
                        .get(dep)
                        .is_some_and(|t| t.status == TaskStatus::Completed)
            })
        };
        let ready: Vec<bool> = tasks.iter().map(is_ready).collect();
        let ready_count = ready.iter().filter(|r| **r).count();

        let remaining = self.queue.remaining_capacity().await;
        if ready_count > remaining {
            return Err(SchedulerError::QueueFull {
                capacity: self.queue.capacity(),
            });
        }

        let mut entries = Vec::with_capacity(ready_count);
        let mut ids = Vec::with_capacity(tasks.len());
        for (task, ready) in tasks.iter_mut().zip(ready) {
            task.sequence = table.next_sequence();
            if ready {
                task.transition_to(TaskStatus::Queued, Some("依赖已满足".to_string()))?;
                entries.push(QueueEntry::from(&*task));
            }
            ids.push(task.id);
        }
        for task in tasks {
            metrics::counter!("devpool_tasks_submitted_total", "task_type" => task.task_type.clone())
                .increment(1);
            debug!("接纳任务: {}", task.entity_description());
            table.insert(task);
        }
        for entry in entries {
            self.queue.push_admitted(entry).await;
        }

        Ok(ids)
    }

    /// 上游完成后重新评估直接下游，全部依赖完成的任务入队
    pub async fn compute_ready(&self, completed: TaskId) -> SchedulerResult<Vec<TaskId>> {
        let mut table = self.store.write().await;
        let mut ready = Vec::new();

        for id in table.dependents_of(&completed).to_vec() {
            let Some(task) = table.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            let all_completed = task.dependencies.iter().all(|dep| {
                table
                    .get(dep)
                    .is_some_and(|t| t.status == TaskStatus::Completed)
            });
            if !all_completed {
                continue;
            }

            let reason = format!("依赖任务 {completed} 已完成");
            let entry = table.update(&id, |t| {
                t.transition_to(TaskStatus::Queued, Some(reason))?;
                Ok(QueueEntry::from(&*t))
            })?;
            self.queue.push_admitted(entry).await;
            ready.push(id);
        }

        if !ready.is_empty() {
            info!("任务 {} 完成后有 {} 个下游任务就绪", completed, ready.len());
        }
        Ok(ready)
    }

    /// 上游失败或取消后，所有仍在等待的下游任务（传递地）标记为失败
    pub async fn propagate_failure(&self, failed: TaskId) -> SchedulerResult<Vec<TaskId>> {
        let mut notifications = Vec::new();
        {
            let mut table = self.store.write().await;
            let mut stack = vec![failed];
            let mut visited = HashSet::new();

            while let Some(current) = stack.pop() {
                for id in table.dependents_of(&current).to_vec() {
                    if !visited.insert(id) {
                        continue;
                    }
                    if table.get(&id).map(|t| t.status) != Some(TaskStatus::Pending) {
                        continue;
                    }

                    let reason = SchedulerError::DependencyFailed {
                        task: id.to_string(),
                        dependency: current.to_string(),
                    }
                    .to_string();
                    let view = table.update(&id, |t| {
                        t.last_error = Some(reason.clone());
                        t.transition_to(TaskStatus::Failed, Some(reason.clone()))?;
                        Ok(TaskView::from(&*t))
                    })?;
                    notifications.push((view, reason));
                    stack.push(id);
                }
            }
        }

        let mut failed_ids = Vec::with_capacity(notifications.len());
        for (view, reason) in notifications {
            warn!("任务 {} 因依赖失败而终止", view.id);
            metrics::counter!("devpool_tasks_failed_total", "reason" => "dependency").increment(1);
            self.notifier.task_failed(&view, &reason).await;
            failed_ids.push(view.id);
        }
        Ok(failed_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpool_domain::TaskPayload;
    use devpool_testing_utils::RecordingNotifier;

    struct Fixture {
        store: Arc<TaskStore>,
        queue: Arc<TaskQueue>,
        notifier: RecordingNotifier,
        resolver: DependencyResolver,
    }

    fn fixture(capacity: usize) -> Fixture {
        let store = Arc::new(TaskStore::new());
        let queue = Arc::new(TaskQueue::new(capacity));
        let notifier = RecordingNotifier::new();
        let resolver = DependencyResolver::new(
            store.clone(),
            queue.clone(),
            Arc::new(notifier.clone()),
        );
        Fixture {
            store,
            queue,
            notifier,
            resolver,
        }
    }

    fn task(deps: Vec<TaskId>) -> Task {
        let mut task = Task::new("testing", TaskPayload::new(), 0);
        task.dependencies = deps;
        task
    }

    async fn complete(store: &TaskStore, id: TaskId) {
        store
            .update(&id, |t| {
                t.transition_to(TaskStatus::Assigned, None)?;
                t.transition_to(TaskStatus::Running, None)?;
                t.transition_to(TaskStatus::Completed, None)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ready_tasks_are_queued() {
        let f = fixture(10);
        let a = task(vec![]);
        let b = task(vec![a.id]);
        let (a_id, b_id) = (a.id, b.id);

        let ids = f.resolver.admit_batch(vec![a, b]).await.unwrap();
        assert_eq!(ids, vec![a_id, b_id]);

        assert_eq!(f.store.get(&a_id).await.unwrap().status, TaskStatus::Queued);
        assert_eq!(f.store.get(&b_id).await.unwrap().status, TaskStatus::Pending);
        assert!(f.queue.contains(&a_id).await);
        assert!(!f.queue.contains(&b_id).await);
    }

    #[tokio::test]
    async fn test_sequences_follow_submission_order() {
        let f = fixture(10);
        let batch = vec![task(vec![]), task(vec![]), task(vec![])];
        let ids = f.resolver.admit_batch(batch).await.unwrap();

        let sequences: Vec<u64> = {
            let mut seqs = Vec::new();
            for id in &ids {
                seqs.push(f.store.get(id).await.unwrap().sequence);
            }
            seqs
        };
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cycle_rejected_nothing_stored() {
        let f = fixture(10);
        let mut x = task(vec![]);
        let mut y = task(vec![]);
        x.dependencies = vec![y.id];
        y.dependencies = vec![x.id];

        let err = f.resolver.admit_batch(vec![x, y]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DependencyCycle { .. }));
        assert!(f.store.is_empty().await);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_self_dependency_is_a_cycle() {
        let f = fixture(10);
        let mut x = task(vec![]);
        x.dependencies = vec![x.id];
        assert!(matches!(
            f.resolver.admit_batch(vec![x]).await,
            Err(SchedulerError::DependencyCycle { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let f = fixture(10);
        let orphan = task(vec![TaskId::new()]);
        assert!(matches!(
            f.resolver.admit_batch(vec![orphan]).await,
            Err(SchedulerError::UnknownDependency { .. })
        ));
        assert!(f.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_depending_on_failed_task_rejected() {
        let f = fixture(10);
        let a = task(vec![]);
        let a_id = a.id;
        f.resolver.admit_batch(vec![a]).await.unwrap();
        f.store
            .update(&a_id, |t| t.transition_to(TaskStatus::Cancelled, None))
            .await
            .unwrap();

        assert!(matches!(
            f.resolver.admit_batch(vec![task(vec![a_id])]).await,
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_full_stores_nothing() {
        let f = fixture(1);
        f.resolver.admit_batch(vec![task(vec![])]).await.unwrap();

        let err = f
            .resolver
            .admit_batch(vec![task(vec![])])
            .await
            .unwrap_err();
        assert_eq!(err, SchedulerError::QueueFull { capacity: 1 });
        assert_eq!(f.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_compute_ready_waits_for_all_dependencies() {
        let f = fixture(10);
        let a = task(vec![]);
        let b = task(vec![]);
        let c = task(vec![a.id, b.id]);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        f.resolver.admit_batch(vec![a, b, c]).await.unwrap();

        // 模拟派发
        f.queue.remove(&a_id).await;
        f.queue.remove(&b_id).await;

        complete(&f.store, a_id).await;
        assert!(f.resolver.compute_ready(a_id).await.unwrap().is_empty());
        assert_eq!(f.store.get(&c_id).await.unwrap().status, TaskStatus::Pending);

        complete(&f.store, b_id).await;
        assert_eq!(f.resolver.compute_ready(b_id).await.unwrap(), vec![c_id]);
        assert_eq!(f.store.get(&c_id).await.unwrap().status, TaskStatus::Queued);
        assert!(f.queue.contains(&c_id).await);

        // 重复计算不会重复入队
        assert!(f.resolver.compute_ready(b_id).await.unwrap().is_empty());
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_propagate_failure_is_transitive() {
        let f = fixture(10);
        let a = task(vec![]);
        let b = task(vec![a.id]);
        let c = task(vec![b.id]);
        let unrelated = task(vec![]);
        let (a_id, b_id, c_id, u_id) = (a.id, b.id, c.id, unrelated.id);
        f.resolver
            .admit_batch(vec![a, b, c, unrelated])
            .await
            .unwrap();

        f.store
            .update(&a_id, |t| t.transition_to(TaskStatus::Cancelled, None))
            .await
            .unwrap();
        let failed = f.resolver.propagate_failure(a_id).await.unwrap();

        assert_eq!(failed.len(), 2);
        for id in [b_id, c_id] {
            let task = f.store.get(&id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert!(task.last_error.is_some());
            assert_eq!(f.notifier.count_for(id), 1);
        }
        assert_eq!(f.store.get(&u_id).await.unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn test_find_cycle_through_existing_graph() {
        let mut table = TaskTable::default();
        let existing = task(vec![]);
        let existing_id = existing.id;
        table.insert(existing);

        let fresh = task(vec![existing_id]);
        assert!(find_cycle(&table, &[fresh]).is_none());
    }
}
