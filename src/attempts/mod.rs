//! Attempts: one execution of a task, and the durable queue that hands them
//! to workers.

pub mod model;
pub mod queue;

pub use model::{Attempt, AttemptState};
pub use queue::AttemptQueue;
