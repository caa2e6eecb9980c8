//! Unified `Database` trait: single async interface for all persistence.
//!
//! The execution core never talks SQL directly: the attempt queue and the
//! pipeline orchestrator only see this trait. Timestamps are passed in by the
//! caller so the store stays clock-free.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::attempts::model::{Attempt, AttemptState};
use crate::error::DatabaseError;
use crate::pipeline::model::RunStep;
use crate::tasks::model::{Board, Task, TaskStatus};

/// Backend-agnostic database trait covering boards, tasks, attempts and steps.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Boards & tasks ──────────────────────────────────────────────

    /// Insert a new board.
    async fn insert_board(&self, board: &Board) -> Result<(), DatabaseError>;

    /// Get a board by ID.
    async fn get_board(&self, id: Uuid) -> Result<Option<Board>, DatabaseError>;

    /// Insert a new task.
    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// Set a task's status and completion time. Returns false if the task
    /// does not exist.
    ///
    /// The board's completed-count moves with the task in the same write:
    /// up when the task becomes `done`, down when it stops being `done`,
    /// unchanged otherwise.
    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    // ── Attempts ────────────────────────────────────────────────────

    /// Insert a new attempt row.
    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), DatabaseError>;

    /// Get an attempt by ID.
    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>, DatabaseError>;

    /// List a task's attempts, newest first.
    async fn list_attempts_for_task(&self, task_id: Uuid) -> Result<Vec<Attempt>, DatabaseError>;

    /// Highest attempt number recorded for a task, or 0.
    async fn max_attempt_number(&self, task_id: Uuid) -> Result<i32, DatabaseError>;

    /// Atomically claim the oldest unclaimed `Queued` attempt for `worker_id`.
    ///
    /// Concurrent callers never receive the same row; a row claimed by one
    /// caller is skipped by the others rather than waited on. The attempt's
    /// state is left as `Queued`.
    async fn claim_next_attempt(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Attempt>, DatabaseError>;

    /// `Queued → Running`, stamping `started_at` and `last_heartbeat_at`.
    /// Returns false if the attempt was not `Queued`.
    async fn mark_attempt_running(&self, id: Uuid, now: DateTime<Utc>)
    -> Result<bool, DatabaseError>;

    /// Move an attempt to a terminal state from any of `from`.
    /// Returns false if the attempt was in none of them.
    async fn complete_attempt(
        &self,
        id: Uuid,
        from: &[AttemptState],
        to: AttemptState,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Set `last_heartbeat_at` on a `Running` or `Cancelling` attempt.
    /// Returns false if the attempt is in neither state.
    async fn touch_attempt_heartbeat(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Count `Running` attempts whose heartbeat is older than `cutoff`.
    async fn count_stale_attempts(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;

    /// Reset stale `Running` attempts to `Queued` and release claims on
    /// `Queued` attempts claimed before `cutoff`. Returns rows changed.
    async fn requeue_stale_attempts(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError>;

    /// Record a cancel request. `Queued` attempts become `Cancelled`,
    /// `Running` attempts become `Cancelling`. Returns the resulting state,
    /// or `None` if the attempt was in neither state.
    async fn request_attempt_cancel(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AttemptState>, DatabaseError>;

    // ── Run steps ───────────────────────────────────────────────────

    /// Insert steps in order.
    async fn insert_steps(&self, steps: &[RunStep]) -> Result<(), DatabaseError>;

    /// List an attempt's steps by sequence number.
    async fn list_steps(&self, attempt_id: Uuid) -> Result<Vec<RunStep>, DatabaseError>;

    /// Number of steps recorded for an attempt.
    async fn count_steps(&self, attempt_id: Uuid) -> Result<usize, DatabaseError>;

    /// Persist every mutable field of a step.
    async fn update_step(&self, step: &RunStep) -> Result<(), DatabaseError>;
}
