//! Work-item data model: boards and the tasks an attempt runs for.
//!
//! Boards and tasks are owned by the CRUD surface; the execution core only
//! reads them and moves a task's status when an attempt finishes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// A board groups tasks and tracks how many of them are done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub name: String,
    /// Number of tasks completed by a successful attempt.
    pub completed_count: i64,
    pub created_at: DateTime<Utc>,
}

impl Board {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            completed_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// A user-defined work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub board_id: Uuid,
    pub title: String,
    pub status: TaskStatus,
    /// Set when a successful attempt marks the task done.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new task in `todo`.
    pub fn new(board_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            board_id,
            title: title.into(),
            status: TaskStatus::Todo,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
