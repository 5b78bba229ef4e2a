#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use devpool_dispatcher::{Scheduler, SchedulerConfig};
use devpool_domain::{PayloadValue, TaskId, TaskPayload, TaskStatus, TaskView};
use devpool_infrastructure::FileCheckpointStore;
use devpool_testing_utils::{RecordingNotifier, TaskSpecBuilder, WorkerBuilder};
use devpool_worker::ShellExecutor;

fn shell(script: &str) -> TaskPayload {
    TaskPayload::new().with("command", "sh").with(
        "args",
        PayloadValue::List(vec!["-c".into(), script.into()]),
    )
}

async fn wait_for_terminal(scheduler: &Scheduler, task_id: TaskId) -> TaskView {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let task = scheduler.get_task(task_id).await.unwrap();
        if task.status.is_terminal() {
            return task;
        }
        assert!(Instant::now() < deadline, "任务 {} 未结束", task_id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn local_scheduler(checkpoints: &tempfile::TempDir) -> Scheduler {
    let config = SchedulerConfig {
        poll_interval: Duration::from_millis(10),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(
        config,
        Arc::new(ShellExecutor::new()),
        Arc::new(RecordingNotifier::new()),
        Arc::new(FileCheckpointStore::new(checkpoints.path()).await.unwrap()),
    );
    scheduler
        .register_worker(
            WorkerBuilder::new("local")
                .with_capabilities(&["code_generation", "testing"])
                .build(),
        )
        .await
        .unwrap();
    scheduler.start().await.unwrap();
    scheduler
}

#[tokio::test]
async fn test_shell_tasks_run_on_local_pool() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = local_scheduler(&dir).await;

    let ids = scheduler
        .submit_batch(vec![
            TaskSpecBuilder::new()
                .with_key("gen")
                .with_payload(shell("echo generated"))
                .build(),
            TaskSpecBuilder::new()
                .with_key("test")
                .with_task_type("testing")
                .with_payload(shell("echo tested"))
                .depends_on_local("gen")
                .build(),
        ])
        .await
        .unwrap();

    for (id, expected) in ids.iter().zip(["generated", "tested"]) {
        let task = wait_for_terminal(&scheduler, *id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output.unwrap().get_str("stdout"), Some(expected));
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_shell_task_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = local_scheduler(&dir).await;

    let script = r#"
        if [ -z "$DEVPOOL_CHECKPOINT_SEQ" ]; then
            echo 'DEVPOOL_CHECKPOINT {"stage": "compiled"}'
        else
            echo "resumed from $DEVPOOL_CHECKPOINT_SEQ"
        fi
    "#;
    let id = scheduler
        .submit_task(TaskSpecBuilder::new().with_payload(shell(script)).build())
        .await
        .unwrap();

    let task = wait_for_terminal(&scheduler, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.checkpoint_seq, Some(1));
    assert_eq!(task.output.unwrap().get_str("stdout"), Some("resumed from 1"));

    let checkpoint = scheduler.latest_checkpoint(id).await.unwrap();
    assert_eq!(checkpoint.payload.get_str("stage"), Some("compiled"));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_non_retryable_command_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = local_scheduler(&dir).await;

    let id = scheduler
        .submit_task(
            TaskSpecBuilder::new()
                .with_payload(shell("echo nope >&2; exit 2").with("retry_on_failure", false))
                .with_max_retries(3)
                .build(),
        )
        .await
        .unwrap();

    let task = wait_for_terminal(&scheduler, id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert!(task.last_error.unwrap().contains("nope"));

    scheduler.shutdown().await;
}
