//! Attempt Runner: durable attempt queue, step pipeline and worker loop.

pub mod attempts;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod tasks;
pub mod worker;
