//! Worker: the process-level driver.
//!
//! - `runner`: poll loop, per-attempt processing and the stale sweep
//! - `heartbeat`: ticker scoped to one attempt's processing

pub mod heartbeat;
pub mod runner;

pub use heartbeat::spawn_heartbeat;
pub use runner::{GENERIC_FAILURE_MESSAGE, WorkerHandles, WorkerLoop};
