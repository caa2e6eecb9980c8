//! Step pipeline orchestrator.
//!
//! Materializes an attempt's steps from [`STEP_TEMPLATE`] and drives them one
//! at a time in sequence order:
//!
//! ```text
//! Pending ──► Running ──► Succeeded ──► next step
//!    │                └─► Failed ─────► stop, later steps stay Pending
//!    └─ no executor ───► Skipped ─────► next step
//! ```
//!
//! Every state change is persisted before moving on, so an observer polling
//! the store sees a step as `Running` while its executor is still working.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attempts::model::{Attempt, AttemptState};
use crate::error::DatabaseError;
use crate::pipeline::executor::StepOutcome;
use crate::pipeline::model::{RunStep, STEP_TEMPLATE, StepKind, StepState};
use crate::pipeline::registry::ExecutorRegistry;
use crate::store::Database;

/// How a pipeline run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every executed step succeeded (skipped steps do not count).
    Succeeded,
    /// A step failed; no later step ran.
    Failed {
        step_id: Uuid,
        kind: StepKind,
        /// The step's own error, if it reported one.
        error: Option<String>,
    },
    /// A cancel was requested; the pipeline stopped before the next step.
    Cancelled,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Drives an attempt's steps through their executors.
pub struct PipelineOrchestrator {
    store: Arc<dyn Database>,
    executors: Arc<ExecutorRegistry>,
}

impl PipelineOrchestrator {
    pub fn new(store: Arc<dyn Database>, executors: Arc<ExecutorRegistry>) -> Self {
        Self { store, executors }
    }

    pub fn executors(&self) -> &Arc<ExecutorRegistry> {
        &self.executors
    }

    /// Insert the fixed step template for an attempt, all `Pending`.
    ///
    /// Not idempotent: calling this twice inserts a second set of steps.
    /// Use [`ensure_steps`](Self::ensure_steps) unless the attempt is known
    /// to have none.
    pub async fn create_steps(&self, attempt: &Attempt) -> Result<Vec<Uuid>, DatabaseError> {
        let steps: Vec<RunStep> = STEP_TEMPLATE
            .iter()
            .enumerate()
            .map(|(i, (kind, name))| RunStep::new(attempt.id, kind.clone(), *name, i as i32 + 1))
            .collect();

        self.store.insert_steps(&steps).await?;
        info!(attempt_id = %attempt.id, count = steps.len(), "Steps created");
        Ok(steps.into_iter().map(|s| s.id).collect())
    }

    /// Create the attempt's steps unless some already exist.
    /// Returns true if steps were created.
    pub async fn ensure_steps(&self, attempt: &Attempt) -> Result<bool, DatabaseError> {
        if self.store.count_steps(attempt.id).await? > 0 {
            debug!(attempt_id = %attempt.id, "Steps already exist");
            return Ok(false);
        }
        self.create_steps(attempt).await?;
        Ok(true)
    }

    /// An attempt's steps in sequence order.
    pub async fn steps_for_attempt(&self, attempt_id: Uuid) -> Result<Vec<RunStep>, DatabaseError> {
        self.store.list_steps(attempt_id).await
    }

    /// Run every pending step in order.
    ///
    /// Steps already `Succeeded` or `Skipped` are left alone, so a requeued
    /// attempt resumes where it stopped. A step left `Running` by a worker
    /// that died is run again. Before each step the attempt is re-read and the
    /// run stops if a cancel was requested.
    ///
    /// Errors are only returned when the store fails; executor faults become
    /// failed steps.
    pub async fn execute_pipeline(
        &self,
        attempt: &Attempt,
    ) -> Result<PipelineOutcome, DatabaseError> {
        let steps = self.store.list_steps(attempt.id).await?;

        for mut step in steps {
            match step.state {
                StepState::Succeeded | StepState::Skipped => continue,
                StepState::Failed => {
                    return Ok(PipelineOutcome::Failed {
                        step_id: step.id,
                        kind: step.kind,
                        error: step.error_message,
                    });
                }
                StepState::Pending | StepState::Running => {}
            }

            if self.cancel_requested(attempt.id).await? {
                info!(
                    attempt_id = %attempt.id,
                    sequence = step.sequence,
                    "Cancel requested, stopping pipeline"
                );
                return Ok(PipelineOutcome::Cancelled);
            }

            let Some(executor) = self.executors.get(&step.kind) else {
                step.state = StepState::Skipped;
                step.completed_at = Some(Utc::now());
                self.store.update_step(&step).await?;
                info!(
                    attempt_id = %attempt.id,
                    step_id = %step.id,
                    kind = %step.kind,
                    "No executor registered, step skipped"
                );
                continue;
            };

            step.state = StepState::Running;
            step.started_at = Some(Utc::now());
            step.completed_at = None;
            step.duration_ms = None;
            step.error_message = None;
            step.output = None;
            step.exit_code = None;
            self.store.update_step(&step).await?;
            info!(
                attempt_id = %attempt.id,
                step_id = %step.id,
                kind = %step.kind,
                sequence = step.sequence,
                "Step started"
            );

            let started = Instant::now();
            let outcome = match AssertUnwindSafe(executor.execute(&step, attempt))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => StepOutcome::failed(e.to_string()),
                Err(panic) => StepOutcome::failed(panic_message(panic)),
            };

            step.completed_at = Some(Utc::now());
            step.duration_ms = Some(started.elapsed().as_millis() as i64);
            step.output = outcome.output;
            step.exit_code = outcome.exit_code;
            step.error_message = outcome.error_message;

            if outcome.success {
                step.state = StepState::Succeeded;
                self.store.update_step(&step).await?;
                info!(
                    attempt_id = %attempt.id,
                    step_id = %step.id,
                    kind = %step.kind,
                    duration_ms = step.duration_ms,
                    "Step succeeded"
                );
            } else {
                step.state = StepState::Failed;
                self.store.update_step(&step).await?;
                warn!(
                    attempt_id = %attempt.id,
                    step_id = %step.id,
                    kind = %step.kind,
                    exit_code = step.exit_code,
                    error = step.error_message.as_deref().unwrap_or(""),
                    "Step failed, halting pipeline"
                );
                return Ok(PipelineOutcome::Failed {
                    step_id: step.id,
                    kind: step.kind,
                    error: step.error_message,
                });
            }
        }

        Ok(PipelineOutcome::Succeeded)
    }

    async fn cancel_requested(&self, attempt_id: Uuid) -> Result<bool, DatabaseError> {
        let state = self
            .store
            .get_attempt(attempt_id)
            .await?
            .map(|a| a.state);
        Ok(state == Some(AttemptState::Cancelling))
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Step executor panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Step executor panicked: {s}")
    } else {
        "Step executor panicked".to_string()
    }
}
