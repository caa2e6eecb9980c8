//! Attempt queue: exclusive dequeue, state transitions, heartbeats and
//! stale recovery.
//!
//! Every transition is a guarded write against the store: the update only
//! applies when the attempt is in an allowed source state, so two workers
//! racing on the same row cannot both win. When a guard rejects a write the
//! attempt is re-read to report why.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attempts::model::{Attempt, AttemptState};
use crate::error::{AttemptError, DatabaseError};
use crate::store::Database;
use crate::tasks::model::TaskStatus;

/// Reason recorded when a caller cancels without giving one.
pub const DEFAULT_CANCEL_REASON: &str = "Cancelled by user";

/// Durable FIFO queue of attempts, backed by the store.
///
/// Cheap to clone; clones share the store handle and worker id.
#[derive(Clone)]
pub struct AttemptQueue {
    store: Arc<dyn Database>,
    worker_id: String,
}

impl AttemptQueue {
    pub fn new(store: Arc<dyn Database>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
        }
    }

    /// Identifier stamped on attempts this queue claims.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    // ── Run requests ────────────────────────────────────────────────

    /// Queue a new attempt for a task.
    ///
    /// The attempt gets the next attempt number for the task and the task
    /// moves to `in_progress`. Re-running a task that was done takes it off
    /// the board's completed count until it succeeds again.
    pub async fn enqueue(
        &self,
        task_id: Uuid,
        correlation_id: Option<String>,
    ) -> Result<Attempt, AttemptError> {
        if self.store.get_task(task_id).await?.is_none() {
            return Err(DatabaseError::NotFound {
                entity: "task".into(),
                id: task_id.to_string(),
            }
            .into());
        }

        let number = self.store.max_attempt_number(task_id).await? + 1;
        let mut attempt = Attempt::new(task_id, number);
        attempt.correlation_id = correlation_id;
        self.store.insert_attempt(&attempt).await?;

        self.store
            .update_task_status(task_id, TaskStatus::InProgress, None)
            .await?;

        info!(
            attempt_id = %attempt.id,
            task_id = %task_id,
            attempt_number = number,
            "Attempt queued"
        );
        Ok(attempt)
    }

    // ── Claiming ────────────────────────────────────────────────────

    /// Claim the oldest queued attempt for this worker.
    ///
    /// The attempt is returned still `Queued`; call [`mark_running`] next.
    /// Returns `None` when nothing is waiting.
    ///
    /// [`mark_running`]: Self::mark_running
    pub async fn dequeue_next(&self) -> Result<Option<Attempt>, AttemptError> {
        let claimed = self
            .store
            .claim_next_attempt(&self.worker_id, Utc::now())
            .await?;

        if let Some(attempt) = &claimed {
            info!(
                attempt_id = %attempt.id,
                task_id = %attempt.task_id,
                worker_id = %self.worker_id,
                "Attempt claimed"
            );
        }
        Ok(claimed)
    }

    /// `Queued → Running`. Stamps `started_at` and the first heartbeat.
    pub async fn mark_running(&self, id: Uuid) -> Result<(), AttemptError> {
        if !self.store.mark_attempt_running(id, Utc::now()).await? {
            return Err(self.rejected(id, AttemptState::Running).await);
        }
        info!(attempt_id = %id, "Attempt running");
        Ok(())
    }

    // ── Terminal transitions ────────────────────────────────────────

    /// Finish an attempt successfully and mark its task done.
    pub async fn mark_succeeded(&self, id: Uuid) -> Result<(), AttemptError> {
        let now = Utc::now();
        let applied = self
            .store
            .complete_attempt(
                id,
                &AttemptState::sources_of(AttemptState::Succeeded),
                AttemptState::Succeeded,
                None,
                now,
            )
            .await?;
        if !applied {
            return Err(self.rejected(id, AttemptState::Succeeded).await);
        }

        let attempt = self.get(id).await?;
        self.complete_task(attempt.task_id).await?;
        info!(attempt_id = %id, task_id = %attempt.task_id, "Attempt succeeded");
        Ok(())
    }

    /// Finish an attempt as failed and return its task to `todo` so it can be
    /// retried.
    pub async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<(), AttemptError> {
        let applied = self
            .store
            .complete_attempt(
                id,
                &AttemptState::sources_of(AttemptState::Failed),
                AttemptState::Failed,
                Some(error_message),
                Utc::now(),
            )
            .await?;
        if !applied {
            return Err(self.rejected(id, AttemptState::Failed).await);
        }

        let attempt = self.get(id).await?;
        self.reset_task(attempt.task_id).await?;
        info!(
            attempt_id = %id,
            task_id = %attempt.task_id,
            error = %error_message,
            "Attempt failed"
        );
        Ok(())
    }

    /// `Cancelling → Cancelled`, once the worker has stopped the pipeline.
    pub async fn mark_cancelled(&self, id: Uuid) -> Result<(), AttemptError> {
        let applied = self
            .store
            .complete_attempt(
                id,
                &[AttemptState::Cancelling],
                AttemptState::Cancelled,
                None,
                Utc::now(),
            )
            .await?;
        if !applied {
            return Err(self.rejected(id, AttemptState::Cancelled).await);
        }

        let attempt = self.get(id).await?;
        self.reset_task(attempt.task_id).await?;
        info!(attempt_id = %id, task_id = %attempt.task_id, "Attempt cancelled");
        Ok(())
    }

    /// Request cancellation.
    ///
    /// A queued attempt is cancelled outright. A running attempt moves to
    /// `Cancelling` and the worker stops it before its next step. Returns the
    /// resulting state.
    pub async fn request_cancel(
        &self,
        id: Uuid,
        reason: Option<&str>,
    ) -> Result<AttemptState, AttemptError> {
        let reason = reason.unwrap_or(DEFAULT_CANCEL_REASON);
        let state = match self
            .store
            .request_attempt_cancel(id, reason, Utc::now())
            .await?
        {
            Some(state) => state,
            None => return Err(self.rejected(id, AttemptState::Cancelling).await),
        };

        if state == AttemptState::Cancelled {
            let attempt = self.get(id).await?;
            self.reset_task(attempt.task_id).await?;
        }
        info!(attempt_id = %id, state = %state, reason, "Cancel requested");
        Ok(state)
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Write a heartbeat. Returns false if the attempt is no longer active.
    pub async fn update_heartbeat(&self, id: Uuid) -> Result<bool, AttemptError> {
        let touched = self.store.touch_attempt_heartbeat(id, Utc::now()).await?;
        if touched {
            debug!(attempt_id = %id, "Heartbeat");
        } else {
            debug!(attempt_id = %id, "Heartbeat skipped, attempt not active");
        }
        Ok(touched)
    }

    /// Requeue running attempts whose heartbeat is older than `timeout`.
    ///
    /// Also releases claims on attempts that were claimed but never started
    /// within `timeout`. Returns the number of attempts recovered.
    pub async fn recover_stale(&self, timeout: Duration) -> Result<usize, AttemptError> {
        // A timeout reaching past the earliest representable time leaves
        // nothing old enough to be stale.
        let Some(cutoff) = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            debug!(timeout_secs = timeout.as_secs(), "Stale timeout out of range, nothing to recover");
            return Ok(0);
        };

        let stale = self.store.count_stale_attempts(cutoff).await?;
        let recovered = self.store.requeue_stale_attempts(cutoff).await?;

        if recovered > 0 {
            warn!(
                count = recovered,
                stale_running = stale,
                timeout_secs = timeout.as_secs(),
                "Recovered stale attempts"
            );
        } else {
            debug!("No stale attempts");
        }
        Ok(recovered)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn get(&self, id: Uuid) -> Result<Attempt, AttemptError> {
        self.store
            .get_attempt(id)
            .await?
            .ok_or(AttemptError::NotFound { id })
    }

    /// A task's attempts, newest first.
    pub async fn attempts_for_task(&self, task_id: Uuid) -> Result<Vec<Attempt>, AttemptError> {
        Ok(self.store.list_attempts_for_task(task_id).await?)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Build the error for a guarded write that matched no row.
    async fn rejected(&self, id: Uuid, target: AttemptState) -> AttemptError {
        match self.store.get_attempt(id).await {
            Ok(Some(attempt)) => AttemptError::InvalidTransition {
                id,
                state: attempt.state.to_string(),
                target: target.to_string(),
            },
            Ok(None) => AttemptError::NotFound { id },
            Err(e) => AttemptError::Database(e),
        }
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), AttemptError> {
        let updated = self
            .store
            .update_task_status(task_id, TaskStatus::Done, Some(Utc::now()))
            .await?;
        if !updated {
            warn!(task_id = %task_id, "Task missing for succeeded attempt");
        }
        Ok(())
    }

    async fn reset_task(&self, task_id: Uuid) -> Result<(), AttemptError> {
        let updated = self
            .store
            .update_task_status(task_id, TaskStatus::Todo, None)
            .await?;
        if !updated {
            warn!(task_id = %task_id, "Task missing for finished attempt");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use futures::future::join_all;

    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tasks::model::{Board, Task};

    struct Fixture {
        store: Arc<dyn Database>,
        queue: AttemptQueue,
        board: Board,
        task: Task,
    }

    async fn fixture() -> Fixture {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let board = Board::new("Board");
        store.insert_board(&board).await.unwrap();
        let task = Task::new(board.id, "Task");
        store.insert_task(&task).await.unwrap();
        let queue = AttemptQueue::new(Arc::clone(&store), "worker-test");
        Fixture {
            store,
            queue,
            board,
            task,
        }
    }

    /// Enqueue, claim and start an attempt.
    async fn running_attempt(f: &Fixture) -> Attempt {
        let attempt = f.queue.enqueue(f.task.id, None).await.unwrap();
        let claimed = f.queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, attempt.id);
        f.queue.mark_running(attempt.id).await.unwrap();
        attempt
    }

    #[tokio::test]
    async fn enqueue_numbers_attempts_and_starts_task() {
        let f = fixture().await;
        let first = f
            .queue
            .enqueue(f.task.id, Some("req-1".into()))
            .await
            .unwrap();
        let second = f.queue.enqueue(f.task.id, None).await.unwrap();

        assert_eq!(first.attempt_number, 1);
        assert_eq!(second.attempt_number, 2);
        assert_eq!(first.correlation_id.as_deref(), Some("req-1"));

        let task = f.store.get_task(f.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);

        let history = f.queue.attempts_for_task(f.task.id).await.unwrap();
        assert_eq!(history[0].id, second.id);
        assert_eq!(history[1].id, first.id);
    }

    #[tokio::test]
    async fn enqueue_unknown_task_is_not_found() {
        let f = fixture().await;
        let err = f.queue.enqueue(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(
            err,
            AttemptError::Database(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn dequeue_empty_returns_none() {
        let f = fixture().await;
        assert!(f.queue.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_is_fifo_by_queued_at() {
        let f = fixture().await;
        let base = Utc::now() - chrono::Duration::minutes(5);
        let t1 = Attempt::new(f.task.id, 1).with_queued_at(base);
        let t2 = Attempt::new(f.task.id, 2).with_queued_at(base + chrono::Duration::seconds(1));
        let t3 = Attempt::new(f.task.id, 3).with_queued_at(base + chrono::Duration::seconds(2));
        // Insert out of order so insertion order cannot explain the result
        for a in [&t2, &t3, &t1] {
            f.store.insert_attempt(a).await.unwrap();
        }

        let first = f.queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(first.id, t1.id);
        assert_eq!(first.state, AttemptState::Queued);
        assert_eq!(first.claimed_by.as_deref(), Some("worker-test"));
    }

    #[tokio::test]
    async fn concurrent_dequeues_never_share_an_attempt() {
        let f = fixture().await;
        for n in 1..=8 {
            f.store
                .insert_attempt(&Attempt::new(f.task.id, n))
                .await
                .unwrap();
        }

        let queues: Vec<AttemptQueue> = (0..6)
            .map(|i| AttemptQueue::new(Arc::clone(&f.store), format!("worker-{i}")))
            .collect();
        let results = join_all(queues.iter().map(|q| q.dequeue_next())).await;

        let ids: Vec<Uuid> = results
            .into_iter()
            .map(|r| r.unwrap().expect("enough attempts for every caller").id)
            .collect();
        let unique: HashSet<Uuid> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn dequeues_across_connections_never_share_an_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let stores: Vec<Arc<dyn Database>> = vec![
            Arc::new(LibSqlBackend::new_local(&path).await.unwrap()),
            Arc::new(LibSqlBackend::new_local(&path).await.unwrap()),
        ];

        let board = Board::new("Board");
        stores[0].insert_board(&board).await.unwrap();
        let task = Task::new(board.id, "Task");
        stores[0].insert_task(&task).await.unwrap();
        for n in 1..=40 {
            stores[0]
                .insert_attempt(&Attempt::new(task.id, n))
                .await
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = AttemptQueue::new(Arc::clone(&stores[i % 2]), format!("worker-{i}"));
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Some(attempt) = queue.dequeue_next().await.unwrap() {
                        assert_eq!(attempt.claimed_by.as_deref(), Some(queue.worker_id()));
                        claimed.push(attempt.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in join_all(handles).await {
            ids.extend(handle.unwrap());
        }
        let unique: HashSet<Uuid> = ids.iter().copied().collect();
        assert_eq!(ids.len(), 40);
        assert_eq!(unique.len(), 40);
    }

    #[tokio::test]
    async fn mark_running_twice_is_rejected() {
        let f = fixture().await;
        let attempt = running_attempt(&f).await;

        let fetched = f.queue.get(attempt.id).await.unwrap();
        assert_eq!(fetched.state, AttemptState::Running);
        assert!(fetched.started_at.is_some());
        assert!(fetched.last_heartbeat_at.is_some());

        let err = f.queue.mark_running(attempt.id).await.unwrap_err();
        match err {
            AttemptError::InvalidTransition { state, target, .. } => {
                assert_eq!(state, "Running");
                assert_eq!(target, "Running");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn mark_running_unknown_attempt_is_not_found() {
        let f = fixture().await;
        let err = f.queue.mark_running(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AttemptError::NotFound { .. }));
    }

    #[tokio::test]
    async fn succeeded_marks_task_done_and_counts_once() {
        let f = fixture().await;
        let attempt = running_attempt(&f).await;
        f.queue.mark_succeeded(attempt.id).await.unwrap();

        let fetched = f.queue.get(attempt.id).await.unwrap();
        assert_eq!(fetched.state, AttemptState::Succeeded);
        assert!(fetched.completed_at.is_some());

        let task = f.store.get_task(f.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.completed_at.is_some());
        let board = f.store.get_board(f.board.id).await.unwrap().unwrap();
        assert_eq!(board.completed_count, 1);

        // Succeeding twice is rejected and does not double count
        assert!(f.queue.mark_succeeded(attempt.id).await.is_err());
        let board = f.store.get_board(f.board.id).await.unwrap().unwrap();
        assert_eq!(board.completed_count, 1);
    }

    #[tokio::test]
    async fn failed_resets_task_to_todo() {
        let f = fixture().await;
        let attempt = running_attempt(&f).await;
        f.queue.mark_failed(attempt.id, "Build failed").await.unwrap();

        let fetched = f.queue.get(attempt.id).await.unwrap();
        assert_eq!(fetched.state, AttemptState::Failed);
        assert_eq!(fetched.error_message.as_deref(), Some("Build failed"));

        let task = f.store.get_task(f.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.completed_at.is_none());
    }

    #[tokio::test]
    async fn rerun_of_done_task_keeps_board_count_in_step() {
        let f = fixture().await;
        let first = running_attempt(&f).await;
        f.queue.mark_succeeded(first.id).await.unwrap();

        let second = running_attempt(&f).await;
        let board = f.store.get_board(f.board.id).await.unwrap().unwrap();
        assert_eq!(board.completed_count, 0);

        f.queue.mark_failed(second.id, "flaky").await.unwrap();
        let board = f.store.get_board(f.board.id).await.unwrap().unwrap();
        assert_eq!(board.completed_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_successes_count_task_once() {
        for _ in 0..50 {
            let f = fixture().await;
            let first = running_attempt(&f).await;
            let second = running_attempt(&f).await;

            let (a, b) = (f.queue.clone(), f.queue.clone());
            let (ra, rb) = tokio::join!(
                tokio::spawn(async move { a.mark_succeeded(first.id).await }),
                tokio::spawn(async move { b.mark_succeeded(second.id).await }),
            );
            ra.unwrap().unwrap();
            rb.unwrap().unwrap();

            let board = f.store.get_board(f.board.id).await.unwrap().unwrap();
            assert_eq!(board.completed_count, 1);
        }
    }

    #[tokio::test]
    async fn stale_attempt_is_requeued_and_claimable_again() {
        let f = fixture().await;
        let attempt = running_attempt(&f).await;
        let timeout = Duration::from_secs(120);

        let silent_since = Utc::now() - chrono::Duration::seconds(121);
        f.store
            .touch_attempt_heartbeat(attempt.id, silent_since)
            .await
            .unwrap();

        assert_eq!(f.queue.recover_stale(timeout).await.unwrap(), 1);

        let requeued = f.queue.get(attempt.id).await.unwrap();
        assert_eq!(requeued.state, AttemptState::Queued);
        assert!(requeued.started_at.is_none());
        assert!(requeued.last_heartbeat_at.is_none());

        let other = AttemptQueue::new(Arc::clone(&f.store), "worker-other");
        let reclaimed = other.dequeue_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, attempt.id);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("worker-other"));
    }

    #[tokio::test]
    async fn live_heartbeat_is_not_recovered() {
        let f = fixture().await;
        let attempt = running_attempt(&f).await;
        assert!(f.queue.update_heartbeat(attempt.id).await.unwrap());

        assert_eq!(
            f.queue.recover_stale(Duration::from_secs(120)).await.unwrap(),
            0
        );
        let fetched = f.queue.get(attempt.id).await.unwrap();
        assert_eq!(fetched.state, AttemptState::Running);
    }

    #[tokio::test]
    async fn out_of_range_stale_timeout_recovers_nothing() {
        let f = fixture().await;
        let attempt = running_attempt(&f).await;

        for timeout in [
            Duration::from_secs(u64::MAX),
            Duration::from_secs(10_000_000_000_000),
        ] {
            assert_eq!(f.queue.recover_stale(timeout).await.unwrap(), 0);
        }
        let fetched = f.queue.get(attempt.id).await.unwrap();
        assert_eq!(fetched.state, AttemptState::Running);
    }

    #[tokio::test]
    async fn heartbeat_on_finished_attempt_is_ignored() {
        let f = fixture().await;
        let attempt = running_attempt(&f).await;
        f.queue.mark_failed(attempt.id, "boom").await.unwrap();
        assert!(!f.queue.update_heartbeat(attempt.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_queued_attempt_finishes_immediately() {
        let f = fixture().await;
        let attempt = f.queue.enqueue(f.task.id, None).await.unwrap();

        let state = f.queue.request_cancel(attempt.id, None).await.unwrap();
        assert_eq!(state, AttemptState::Cancelled);

        let fetched = f.queue.get(attempt.id).await.unwrap();
        assert_eq!(
            fetched.cancellation_reason.as_deref(),
            Some(DEFAULT_CANCEL_REASON)
        );
        let task = f.store.get_task(f.task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Todo);

        // Nothing left to claim
        assert!(f.queue.dequeue_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_running_attempt_goes_through_cancelling() {
        let f = fixture().await;
        let attempt = running_attempt(&f).await;

        let state = f
            .queue
            .request_cancel(attempt.id, Some("superseded"))
            .await
            .unwrap();
        assert_eq!(state, AttemptState::Cancelling);

        // Heartbeats continue while the worker winds down
        assert!(f.queue.update_heartbeat(attempt.id).await.unwrap());

        f.queue.mark_cancelled(attempt.id).await.unwrap();
        let fetched = f.queue.get(attempt.id).await.unwrap();
        assert_eq!(fetched.state, AttemptState::Cancelled);
        assert_eq!(fetched.cancellation_reason.as_deref(), Some("superseded"));

        let err = f.queue.request_cancel(attempt.id, None).await.unwrap_err();
        assert!(matches!(err, AttemptError::InvalidTransition { .. }));
    }
}
