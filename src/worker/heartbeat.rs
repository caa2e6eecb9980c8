//! Heartbeat ticker for an attempt in progress.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::attempts::AttemptQueue;

/// Spawn a task that writes a heartbeat for `attempt_id` every `interval`
/// until `cancel` fires.
///
/// The first write happens one interval in, since `mark_running` stamps the
/// initial heartbeat. A failed write is logged and retried on the next tick.
pub fn spawn_heartbeat(
    queue: AttemptQueue,
    attempt_id: Uuid,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    match queue.update_heartbeat(attempt_id).await {
                        Ok(true) => {}
                        Ok(false) => debug!(attempt_id = %attempt_id, "Attempt no longer active"),
                        Err(e) => warn!(attempt_id = %attempt_id, error = %e, "Heartbeat write failed"),
                    }
                }
            }
        }

        debug!(attempt_id = %attempt_id, "Heartbeat stopped");
    })
}
