//! Worker loop: polls the attempt queue and runs each claimed attempt's
//! pipeline, with a heartbeat ticker alongside and an independent stale sweep.
//!
//! Nothing that goes wrong while processing one attempt stops the loop: every
//! error ends as a failed attempt plus a log entry. A worker that dies without
//! an error at all is covered by the stale sweep of some other worker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::attempts::{Attempt, AttemptQueue, AttemptState};
use crate::config::WorkerConfig;
use crate::error::DatabaseError;
use crate::pipeline::{PipelineOrchestrator, PipelineOutcome};
use crate::worker::heartbeat::spawn_heartbeat;

/// Recorded when the pipeline fails without a step error to report.
pub const GENERIC_FAILURE_MESSAGE: &str = "Pipeline execution failed";

/// Background tasks of a running worker.
pub struct WorkerHandles {
    pub poll: JoinHandle<()>,
    pub stale_sweep: JoinHandle<()>,
}

impl WorkerHandles {
    /// Wait for both loops to exit.
    pub async fn join(self) {
        if let Err(e) = self.poll.await {
            error!(error = %e, "Poll loop task failed");
        }
        if let Err(e) = self.stale_sweep.await {
            error!(error = %e, "Stale sweep task failed");
        }
    }
}

/// Process-level driver tying the queue and the pipeline together.
pub struct WorkerLoop {
    queue: AttemptQueue,
    orchestrator: Arc<PipelineOrchestrator>,
    config: WorkerConfig,
}

impl WorkerLoop {
    pub fn new(
        queue: AttemptQueue,
        orchestrator: Arc<PipelineOrchestrator>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start the poll loop and the stale sweep. Both stop when `cancel` fires;
    /// an attempt already in progress runs to the end of its pipeline first.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> WorkerHandles {
        let poller = Arc::clone(&self);
        let poll_cancel = cancel.clone();
        let poll = tokio::spawn(async move { poller.run_poll_loop(poll_cancel).await });

        let sweeper = self;
        let stale_sweep = tokio::spawn(async move { sweeper.run_stale_sweep(cancel).await });

        WorkerHandles { poll, stale_sweep }
    }

    /// Dequeue and process attempts until cancelled, sleeping between empty polls.
    pub async fn run_poll_loop(&self, cancel: CancellationToken) {
        info!(
            worker_id = %self.queue.worker_id(),
            poll_secs = self.config.poll_interval.as_secs_f64(),
            "Worker poll loop started"
        );

        while !cancel.is_cancelled() {
            if self.poll_once(&cancel).await.is_some() {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.queue.worker_id(), "Worker poll loop stopped");
    }

    /// Requeue stale attempts on a fixed interval until cancelled.
    pub async fn run_stale_sweep(&self, cancel: CancellationToken) {
        info!(
            check_secs = self.config.stale_check_interval.as_secs_f64(),
            timeout_secs = self.config.stale_timeout.as_secs_f64(),
            "Stale attempt sweep started"
        );

        let mut tick = tokio::time::interval(self.config.stale_check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    match self.queue.recover_stale(self.config.stale_timeout).await {
                        Ok(count) => debug!(count, "Stale sweep complete"),
                        Err(e) => error!(error = %e, "Stale sweep failed"),
                    }
                }
            }
        }

        info!("Stale attempt sweep stopped");
    }

    /// Claim and process at most one attempt.
    ///
    /// Returns the attempt id and the terminal state recorded for it, or
    /// `None` if nothing was claimed. The state is `None` when the attempt
    /// could not be started or its result could not be recorded.
    pub async fn poll_once(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(Uuid, Option<AttemptState>)> {
        let attempt = match self.queue.dequeue_next().await {
            Ok(Some(attempt)) => attempt,
            Ok(None) => return None,
            Err(e) => {
                error!(error = %e, "Failed to dequeue attempt");
                return None;
            }
        };

        let id = attempt.id;
        let state = self.process_attempt(attempt, cancel).await;
        Some((id, state))
    }

    /// Run one claimed attempt to a terminal state.
    async fn process_attempt(
        &self,
        attempt: Attempt,
        cancel: &CancellationToken,
    ) -> Option<AttemptState> {
        let id = attempt.id;

        // A cancel can land between claim and start; the guard rejects it then.
        if let Err(e) = self.queue.mark_running(id).await {
            warn!(attempt_id = %id, error = %e, "Claimed attempt could not be started");
            return None;
        }

        let heartbeat_cancel = cancel.child_token();
        let heartbeat = spawn_heartbeat(
            self.queue.clone(),
            id,
            self.config.heartbeat_interval,
            heartbeat_cancel.clone(),
        );

        let result = match AssertUnwindSafe(self.run_pipeline(&attempt))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err("Worker panicked while running pipeline".to_string()),
        };

        heartbeat_cancel.cancel();
        if let Err(e) = heartbeat.await {
            warn!(attempt_id = %id, error = %e, "Heartbeat task ended abnormally");
        }

        let recorded = match &result {
            Ok(PipelineOutcome::Succeeded) => self
                .queue
                .mark_succeeded(id)
                .await
                .map(|_| AttemptState::Succeeded),
            Ok(PipelineOutcome::Failed { error, .. }) => {
                let message = error.as_deref().unwrap_or(GENERIC_FAILURE_MESSAGE);
                self.queue
                    .mark_failed(id, message)
                    .await
                    .map(|_| AttemptState::Failed)
            }
            Ok(PipelineOutcome::Cancelled) => self
                .queue
                .mark_cancelled(id)
                .await
                .map(|_| AttemptState::Cancelled),
            Err(message) => {
                error!(attempt_id = %id, error = %message, "Attempt processing failed");
                self.queue
                    .mark_failed(id, message)
                    .await
                    .map(|_| AttemptState::Failed)
            }
        };

        match recorded {
            Ok(state) => Some(state),
            Err(e) if result.is_ok() => {
                // Recording the outcome failed; fall back to a failed attempt.
                error!(attempt_id = %id, error = %e, "Failed to record attempt result");
                match self.queue.mark_failed(id, &e.to_string()).await {
                    Ok(()) => Some(AttemptState::Failed),
                    Err(e) => {
                        error!(attempt_id = %id, error = %e, "Failed to mark attempt failed");
                        None
                    }
                }
            }
            Err(e) => {
                error!(attempt_id = %id, error = %e, "Failed to mark attempt failed");
                None
            }
        }
    }

    async fn run_pipeline(&self, attempt: &Attempt) -> Result<PipelineOutcome, DatabaseError> {
        self.orchestrator.ensure_steps(attempt).await?;
        self.orchestrator.execute_pipeline(attempt).await
    }
}
