//! Integration tests for the worker loop over a real libSQL store.
//!
//! Each test starts one or more workers with short intervals, queues work
//! through the public API, and waits (bounded) for attempts to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use attempt_runner::attempts::{Attempt, AttemptQueue, AttemptState};
use attempt_runner::config::{StepCommands, WorkerConfig};
use attempt_runner::error::StepError;
use attempt_runner::pipeline::{
    ExecutorRegistry, PipelineOrchestrator, RunStep, StepExecutor, StepKind, StepOutcome,
    StepState, shell_registry,
};
use attempt_runner::store::{Database, LibSqlBackend};
use attempt_runner::tasks::{Board, Task, TaskStatus};
use attempt_runner::worker::{WorkerHandles, WorkerLoop};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Records which attempts it ran, and how often.
#[derive(Default)]
struct CountingExecutor {
    runs: Mutex<HashMap<Uuid, usize>>,
}

#[async_trait]
impl StepExecutor for CountingExecutor {
    fn kind(&self) -> StepKind {
        StepKind::Restore
    }

    async fn execute(&self, _step: &RunStep, attempt: &Attempt) -> Result<StepOutcome, StepError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        *self.runs.lock().unwrap().entry(attempt.id).or_default() += 1;
        Ok(StepOutcome::succeeded().with_output("restored"))
    }
}

fn fast_config(worker_id: &str) -> WorkerConfig {
    WorkerConfig::default()
        .with_worker_id(worker_id)
        .with_poll_interval(Duration::from_millis(10))
        .with_heartbeat_interval(Duration::from_millis(20))
        .with_stale_recovery(Duration::from_millis(20), Duration::from_secs(1))
}

async fn seed(db: &Arc<dyn Database>) -> (Board, Task) {
    let board = Board::new("Integration");
    db.insert_board(&board).await.unwrap();
    let task = Task::new(board.id, "Ship it");
    db.insert_task(&task).await.unwrap();
    (board, task)
}

fn start_worker(
    db: &Arc<dyn Database>,
    registry: ExecutorRegistry,
    config: WorkerConfig,
    cancel: &CancellationToken,
) -> WorkerHandles {
    let orchestrator = Arc::new(PipelineOrchestrator::new(Arc::clone(db), Arc::new(registry)));
    let queue = AttemptQueue::new(Arc::clone(db), config.worker_id.clone());
    Arc::new(WorkerLoop::new(queue, orchestrator, config)).spawn(cancel.clone())
}

/// Poll until every attempt is terminal.
async fn wait_terminal(db: &Arc<dyn Database>, ids: &[Uuid]) -> Vec<Attempt> {
    loop {
        let mut attempts = Vec::with_capacity(ids.len());
        for id in ids {
            attempts.push(db.get_attempt(*id).await.unwrap().unwrap());
        }
        if attempts.iter().all(|a| a.state.is_terminal()) {
            return attempts;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn two_workers_run_each_attempt_once() {
    let dir = tempfile::tempdir().unwrap();
    let db: Arc<dyn Database> =
        Arc::new(LibSqlBackend::new_local(&dir.path().join("runner.db")).await.unwrap());
    let (board, task) = seed(&db).await;

    let producer = AttemptQueue::new(Arc::clone(&db), "producer");
    let mut ids = Vec::new();
    for i in 0..6 {
        let attempt = producer
            .enqueue(task.id, Some(format!("req-{i}")))
            .await
            .unwrap();
        ids.push(attempt.id);
    }

    let executor = Arc::new(CountingExecutor::default());
    let cancel = CancellationToken::new();
    let workers: Vec<WorkerHandles> = ["worker-a", "worker-b"]
        .into_iter()
        .map(|name| {
            let registry = ExecutorRegistry::new().with(executor.clone());
            start_worker(&db, registry, fast_config(name), &cancel)
        })
        .collect();

    let attempts = timeout(TEST_TIMEOUT, wait_terminal(&db, &ids))
        .await
        .expect("all attempts finish");
    assert!(attempts.iter().all(|a| a.state == AttemptState::Succeeded));

    let runs = executor.runs.lock().unwrap().clone();
    assert_eq!(runs.len(), ids.len());
    assert!(runs.values().all(|&n| n == 1), "an attempt ran twice: {runs:?}");

    cancel.cancel();
    for handles in workers {
        timeout(TEST_TIMEOUT, handles.join()).await.unwrap();
    }

    let task = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    let board = db.get_board(board.id).await.unwrap().unwrap();
    assert_eq!(board.completed_count, 1);
}

#[tokio::test]
async fn crashed_worker_attempt_is_recovered_and_finished() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let (_, task) = seed(&db).await;

    // A worker claims and starts the attempt, then dies without a trace.
    let dead = AttemptQueue::new(Arc::clone(&db), "worker-dead");
    let attempt = dead.enqueue(task.id, None).await.unwrap();
    dead.dequeue_next().await.unwrap().unwrap();
    dead.mark_running(attempt.id).await.unwrap();
    db.touch_attempt_heartbeat(attempt.id, Utc::now() - chrono::Duration::seconds(5))
        .await
        .unwrap();

    let executor = Arc::new(CountingExecutor::default());
    let cancel = CancellationToken::new();
    let handles = start_worker(
        &db,
        ExecutorRegistry::new().with(executor.clone()),
        fast_config("worker-live"),
        &cancel,
    );

    let finished = timeout(TEST_TIMEOUT, wait_terminal(&db, &[attempt.id]))
        .await
        .expect("recovered attempt finishes");
    assert_eq!(finished[0].state, AttemptState::Succeeded);
    assert_eq!(finished[0].claimed_by.as_deref(), Some("worker-live"));
    assert_eq!(executor.runs.lock().unwrap().get(&attempt.id), Some(&1));

    cancel.cancel();
    timeout(TEST_TIMEOUT, handles.join()).await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn shell_steps_halt_on_first_failing_command() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let (_, task) = seed(&db).await;

    let commands = StepCommands {
        restore: Some("echo restoring".into()),
        build: Some("echo 'syntax error' >&2; exit 1".into()),
        test: Some("echo should-not-run".into()),
        working_dir: None,
        timeout: Duration::from_secs(30),
    };

    let queue = AttemptQueue::new(Arc::clone(&db), "producer");
    let attempt = queue.enqueue(task.id, None).await.unwrap();

    let cancel = CancellationToken::new();
    let handles = start_worker(
        &db,
        shell_registry(&commands),
        fast_config("worker-shell"),
        &cancel,
    );

    let finished = timeout(TEST_TIMEOUT, wait_terminal(&db, &[attempt.id]))
        .await
        .expect("attempt finishes");
    cancel.cancel();
    timeout(TEST_TIMEOUT, handles.join()).await.unwrap();

    let attempt = &finished[0];
    assert_eq!(attempt.state, AttemptState::Failed);
    assert_eq!(
        attempt.error_message.as_deref(),
        Some("Build exited with code 1")
    );

    let steps = db.list_steps(attempt.id).await.unwrap();
    let states: Vec<StepState> = steps.iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![
            StepState::Succeeded,
            StepState::Failed,
            StepState::Pending,
            StepState::Pending,
            StepState::Pending,
        ]
    );
    assert!(steps[0].output.as_deref().unwrap().contains("restoring"));
    assert!(steps[1].output.as_deref().unwrap().contains("syntax error"));
    assert_eq!(steps[1].exit_code, Some(1));

    let task = db.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Todo);
}
