//! Work items (tasks) and their boards.

pub mod model;

pub use model::{Board, Task, TaskStatus};
