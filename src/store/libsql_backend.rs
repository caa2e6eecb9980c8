//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 (microseconds, `Z` suffix) so that string comparison
//! in SQL orders them chronologically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::attempts::model::{Attempt, AttemptState};
use crate::error::DatabaseError;
use crate::pipeline::model::{RunStep, StepKind, StepState};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::{Board, Task, TaskStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Other processes may hold the same file; wait out their write locks.
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA busy_timeout = 5000"] {
            conn.query(pragma, ())
                .await
                .map_err(|e| DatabaseError::Pool(format!("{pragma}: {e}")))?;
        }

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn parse_uuid(field: &str, s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Query(format!("{field} parse: {e}")))
}

/// SQL list literal for a set of attempt states, e.g. `'Running','Cancelling'`.
///
/// Only ever built from `AttemptState::as_str`, never from user input.
fn state_list(states: &[AttemptState]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}

fn active_states() -> Vec<AttemptState> {
    AttemptState::ALL
        .into_iter()
        .filter(AttemptState::is_active)
        .collect()
}

fn task_status_to_str(status: TaskStatus) -> Result<String, DatabaseError> {
    let value =
        serde_json::to_value(status).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    Ok(value.as_str().unwrap_or("todo").to_string())
}

fn str_to_task_status(s: String) -> TaskStatus {
    serde_json::from_value(serde_json::Value::String(s)).unwrap_or(TaskStatus::Todo)
}

async fn first_count(mut rows: libsql::Rows, op: &str) -> Result<i64, DatabaseError> {
    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

/// Column list for attempt SELECT / RETURNING (13 columns).
const ATTEMPT_COLUMNS: &str = "id, task_id, state, attempt_number, queued_at, started_at, completed_at, last_heartbeat_at, error_message, cancellation_reason, correlation_id, claimed_by, claimed_at";

fn row_to_attempt(row: &libsql::Row) -> Result<Attempt, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("attempt.id: {e}")))?;
    let task_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("attempt.task_id: {e}")))?;
    let state_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("attempt.state: {e}")))?;
    let state: AttemptState = state_str.parse().map_err(DatabaseError::Serialization)?;
    let attempt_number: i64 = row.get(3).unwrap_or(0);
    let queued_at_str: String = row.get(4).unwrap_or_default();

    Ok(Attempt {
        id: parse_uuid("attempt.id", &id_str)?,
        task_id: parse_uuid("attempt.task_id", &task_str)?,
        state,
        attempt_number: attempt_number as i32,
        queued_at: parse_datetime(&queued_at_str),
        started_at: parse_optional_datetime(row.get::<String>(5).ok()),
        completed_at: parse_optional_datetime(row.get::<String>(6).ok()),
        last_heartbeat_at: parse_optional_datetime(row.get::<String>(7).ok()),
        error_message: row.get::<String>(8).ok(),
        cancellation_reason: row.get::<String>(9).ok(),
        correlation_id: row.get::<String>(10).ok(),
        claimed_by: row.get::<String>(11).ok(),
        claimed_at: parse_optional_datetime(row.get::<String>(12).ok()),
    })
}

/// Column list for step SELECT queries (12 columns).
const STEP_COLUMNS: &str = "id, attempt_id, kind, name, state, sequence, started_at, completed_at, duration_ms, error_message, output, exit_code";

fn row_to_step(row: &libsql::Row) -> Result<RunStep, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("step.id: {e}")))?;
    let attempt_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("step.attempt_id: {e}")))?;
    let kind_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("step.kind: {e}")))?;
    let kind: StepKind = kind_str.parse().map_err(DatabaseError::Serialization)?;
    let name: String = row.get(3).unwrap_or_default();
    let state_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("step.state: {e}")))?;
    let state: StepState = state_str.parse().map_err(DatabaseError::Serialization)?;
    let sequence: i64 = row.get(5).unwrap_or(0);

    Ok(RunStep {
        id: parse_uuid("step.id", &id_str)?,
        attempt_id: parse_uuid("step.attempt_id", &attempt_str)?,
        kind,
        name,
        state,
        sequence: sequence as i32,
        started_at: parse_optional_datetime(row.get::<String>(6).ok()),
        completed_at: parse_optional_datetime(row.get::<String>(7).ok()),
        duration_ms: row.get::<i64>(8).ok(),
        error_message: row.get::<String>(9).ok(),
        output: row.get::<String>(10).ok(),
        exit_code: row.get::<i64>(11).ok().map(|c| c as i32),
    })
}

const TASK_COLUMNS: &str = "id, board_id, title, status, completed_at, created_at, updated_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let board_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.board_id: {e}")))?;
    let created_str: String = row.get(5).unwrap_or_default();
    let updated_str: String = row.get(6).unwrap_or_default();

    Ok(Task {
        id: parse_uuid("task.id", &id_str)?,
        board_id: parse_uuid("task.board_id", &board_str)?,
        title: row.get(2).unwrap_or_default(),
        status: str_to_task_status(row.get(3).unwrap_or_else(|_| "todo".to_string())),
        completed_at: parse_optional_datetime(row.get::<String>(4).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Boards & tasks ──────────────────────────────────────────────

    async fn insert_board(&self, board: &Board) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO boards (id, name, completed_count, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    board.id.to_string(),
                    board.name.as_str(),
                    board.completed_count,
                    fmt_ts(board.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_board: {e}")))?;
        Ok(())
    }

    async fn get_board(&self, id: Uuid) -> Result<Option<Board>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, completed_count, created_at FROM boards WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_board: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id_str: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("board.id: {e}")))?;
                let created_str: String = row.get(3).unwrap_or_default();
                Ok(Some(Board {
                    id: parse_uuid("board.id", &id_str)?,
                    name: row.get(1).unwrap_or_default(),
                    completed_count: row.get(2).unwrap_or(0),
                    created_at: parse_datetime(&created_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_board row: {e}"))),
        }
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let status = task_status_to_str(task.status)?;
        self.conn()
            .execute(
                "INSERT INTO tasks (id, board_id, title, status, completed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id.to_string(),
                    task.board_id.to_string(),
                    task.title.as_str(),
                    status,
                    task.completed_at.map(fmt_ts),
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        debug!(id = %task.id, "Task created");
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let status_str = task_status_to_str(status)?;
        let now = fmt_ts(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, completed_at = ?2, updated_at = ?3 WHERE id = ?4",
                params![status_str, completed_at.map(fmt_ts), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_status: {e}")))?;
        Ok(count > 0)
    }

    // ── Attempts ────────────────────────────────────────────────────

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO attempts ({ATTEMPT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    attempt.id.to_string(),
                    attempt.task_id.to_string(),
                    attempt.state.as_str(),
                    attempt.attempt_number as i64,
                    fmt_ts(attempt.queued_at),
                    attempt.started_at.map(fmt_ts),
                    attempt.completed_at.map(fmt_ts),
                    attempt.last_heartbeat_at.map(fmt_ts),
                    attempt.error_message.as_deref(),
                    attempt.cancellation_reason.as_deref(),
                    attempt.correlation_id.as_deref(),
                    attempt.claimed_by.as_deref(),
                    attempt.claimed_at.map(fmt_ts),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_attempt: {e}")))?;
        debug!(attempt_id = %attempt.id, task_id = %attempt.task_id, "Attempt inserted");
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_attempt(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_attempt row: {e}"))),
        }
    }

    async fn list_attempts_for_task(&self, task_id: Uuid) -> Result<Vec<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE task_id = ?1 ORDER BY attempt_number DESC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts_for_task: {e}")))?;

        let mut attempts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            attempts.push(row_to_attempt(&row)?);
        }
        Ok(attempts)
    }

    async fn max_attempt_number(&self, task_id: Uuid) -> Result<i32, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(attempt_number), 0) FROM attempts WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("max_attempt_number: {e}")))?;
        Ok(first_count(rows, "max_attempt_number").await? as i32)
    }

    async fn claim_next_attempt(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Attempt>, DatabaseError> {
        // One statement: the subselect and the claim run under the same write
        // lock, so a row claimed by another caller is never selected again.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE attempts SET claimed_by = ?1, claimed_at = ?2
                     WHERE id = (
                         SELECT id FROM attempts
                         WHERE state = 'Queued' AND claimed_by IS NULL
                         ORDER BY queued_at ASC, rowid ASC
                         LIMIT 1
                     )
                     RETURNING {ATTEMPT_COLUMNS}"
                ),
                params![worker_id, fmt_ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let attempt = row_to_attempt(&row)?;
                debug!(attempt_id = %attempt.id, worker_id, "Attempt claimed");
                Ok(Some(attempt))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_next_attempt row: {e}"))),
        }
    }

    async fn mark_attempt_running(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let ts = fmt_ts(now);
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE attempts SET state = 'Running', started_at = ?1, last_heartbeat_at = ?1
                     WHERE id = ?2 AND state IN ({})",
                    state_list(&AttemptState::sources_of(AttemptState::Running))
                ),
                params![ts, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_attempt_running: {e}")))?;
        Ok(count > 0)
    }

    async fn complete_attempt(
        &self,
        id: Uuid,
        from: &[AttemptState],
        to: AttemptState,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let from: Vec<AttemptState> = from
            .iter()
            .copied()
            .filter(|state| state.can_transition_to(to))
            .collect();
        if from.is_empty() {
            return Ok(false);
        }
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE attempts SET state = ?1, completed_at = ?2, error_message = COALESCE(?3, error_message)
                     WHERE id = ?4 AND state IN ({})",
                    state_list(&from)
                ),
                params![to.as_str(), fmt_ts(now), error_message, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_attempt: {e}")))?;
        Ok(count > 0)
    }

    async fn touch_attempt_heartbeat(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE attempts SET last_heartbeat_at = ?1 WHERE id = ?2 AND state IN ({})",
                    state_list(&active_states())
                ),
                params![fmt_ts(at), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("touch_attempt_heartbeat: {e}")))?;
        Ok(count > 0)
    }

    async fn count_stale_attempts(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT COUNT(*) FROM attempts
                     WHERE state IN ({}) AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1)",
                    state_list(&AttemptState::sources_of(AttemptState::Queued))
                ),
                params![fmt_ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_stale_attempts: {e}")))?;
        Ok(first_count(rows, "count_stale_attempts").await? as usize)
    }

    async fn requeue_stale_attempts(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let cutoff = fmt_ts(cutoff);
        let requeued = self
            .conn()
            .execute(
                &format!(
                    "UPDATE attempts
                     SET state = 'Queued', started_at = NULL, last_heartbeat_at = NULL,
                         claimed_by = NULL, claimed_at = NULL
                     WHERE state IN ({}) AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1)",
                    state_list(&AttemptState::sources_of(AttemptState::Queued))
                ),
                params![cutoff.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_stale_attempts: {e}")))?;

        // Claimed but never marked running: the claimer died in between.
        let released = self
            .conn()
            .execute(
                "UPDATE attempts SET claimed_by = NULL, claimed_at = NULL
                 WHERE state = 'Queued' AND claimed_by IS NOT NULL AND claimed_at < ?1",
                params![cutoff.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_orphaned_claims: {e}")))?;

        Ok((requeued + released) as usize)
    }

    async fn request_attempt_cancel(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AttemptState>, DatabaseError> {
        let conn = self.conn();
        let cancelled = conn
            .execute(
                "UPDATE attempts SET state = 'Cancelled', cancellation_reason = ?1, completed_at = ?2
                 WHERE id = ?3 AND state = 'Queued'",
                params![reason, fmt_ts(now), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("request_attempt_cancel: {e}")))?;
        if cancelled > 0 {
            return Ok(Some(AttemptState::Cancelled));
        }

        let cancelling = conn
            .execute(
                &format!(
                    "UPDATE attempts SET state = 'Cancelling', cancellation_reason = ?1
                     WHERE id = ?2 AND state IN ({})",
                    state_list(&AttemptState::sources_of(AttemptState::Cancelling))
                ),
                params![reason, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("request_attempt_cancel: {e}")))?;
        if cancelling > 0 {
            return Ok(Some(AttemptState::Cancelling));
        }

        Ok(None)
    }

    // ── Run steps ───────────────────────────────────────────────────

    async fn insert_steps(&self, steps: &[RunStep]) -> Result<(), DatabaseError> {
        let conn = self.conn();
        for step in steps {
            conn.execute(
                &format!(
                    "INSERT INTO run_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    step.id.to_string(),
                    step.attempt_id.to_string(),
                    step.kind.to_string(),
                    step.name.as_str(),
                    step.state.as_str(),
                    step.sequence as i64,
                    step.started_at.map(fmt_ts),
                    step.completed_at.map(fmt_ts),
                    step.duration_ms,
                    step.error_message.as_deref(),
                    step.output.as_deref(),
                    step.exit_code.map(|c| c as i64),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_steps: {e}")))?;
        }
        Ok(())
    }

    async fn list_steps(&self, attempt_id: Uuid) -> Result<Vec<RunStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM run_steps WHERE attempt_id = ?1 ORDER BY sequence ASC, rowid ASC"
                ),
                params![attempt_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_steps: {e}")))?;

        let mut steps = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            steps.push(row_to_step(&row)?);
        }
        Ok(steps)
    }

    async fn count_steps(&self, attempt_id: Uuid) -> Result<usize, DatabaseError> {
        let rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM run_steps WHERE attempt_id = ?1",
                params![attempt_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_steps: {e}")))?;
        Ok(first_count(rows, "count_steps").await? as usize)
    }

    async fn update_step(&self, step: &RunStep) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE run_steps SET state = ?1, started_at = ?2, completed_at = ?3, duration_ms = ?4,
                 error_message = ?5, output = ?6, exit_code = ?7 WHERE id = ?8",
                params![
                    step.state.as_str(),
                    step.started_at.map(fmt_ts),
                    step.completed_at.map(fmt_ts),
                    step.duration_ms,
                    step.error_message.as_deref(),
                    step.output.as_deref(),
                    step.exit_code.map(|c| c as i64),
                    step.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_step: {e}")))?;

        debug!(step_id = %step.id, state = %step.state, "Step persisted");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────
