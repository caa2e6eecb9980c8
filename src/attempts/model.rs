//! Attempt state machine and record.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of an attempt.
///
/// The variant names are persisted verbatim (`"Queued"`, `"Succeeded"`, ...)
/// and are read by external consumers of the attempts table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptState {
    /// Waiting to be claimed by a worker.
    Queued,
    /// A worker is executing the pipeline and heartbeating.
    Running,
    /// Every executed step succeeded.
    Succeeded,
    /// A step failed or the worker hit an error.
    Failed,
    /// A cancel was requested while running.
    Cancelling,
    /// Cancelled before or during execution.
    Cancelled,
}

impl AttemptState {
    pub const ALL: [AttemptState; 6] = [
        Self::Queued,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Cancelling,
        Self::Cancelled,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: AttemptState) -> bool {
        use AttemptState::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) | (Queued, Cancelled) |
            // From Running (Queued is stale recovery)
            (Running, Succeeded) | (Running, Failed) |
            (Running, Cancelling) | (Running, Queued) |
            // From Cancelling (the pipeline may still finish on its own)
            (Cancelling, Cancelled) | (Cancelling, Succeeded) | (Cancelling, Failed)
        )
    }

    /// Every state allowed to move to `target`. Guarded store writes are
    /// built from this.
    pub fn sources_of(target: AttemptState) -> Vec<AttemptState> {
        Self::ALL
            .into_iter()
            .filter(|state| state.can_transition_to(target))
            .collect()
    }

    /// A worker owns the attempt and is expected to heartbeat.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Cancelling)
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Persisted string value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelling => "Cancelling",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Queued" => Ok(Self::Queued),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            "Cancelling" => Ok(Self::Cancelling),
            "Cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown attempt state: {other}")),
        }
    }
}

/// One execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    /// Owning work item.
    pub task_id: Uuid,
    pub state: AttemptState,
    /// Monotonic per task, starting at 1.
    pub attempt_number: i32,
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    /// Caller-supplied id tying the attempt to the request that queued it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Worker holding the claim, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Attempt {
    /// Create a new queued attempt.
    pub fn new(task_id: Uuid, attempt_number: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            state: AttemptState::Queued,
            attempt_number,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
            error_message: None,
            cancellation_reason: None,
            correlation_id: None,
            claimed_by: None,
            claimed_at: None,
        }
    }

    /// Builder: set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Builder: set the enqueue time.
    pub fn with_queued_at(mut self, queued_at: DateTime<Utc>) -> Self {
        self.queued_at = queued_at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        use AttemptState::*;

        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Queued));
        assert!(Running.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Cancelled));

        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Queued));
    }

    #[test]
    fn guard_sources_follow_transitions() {
        use AttemptState::*;

        assert_eq!(AttemptState::sources_of(Running), vec![Queued]);
        assert_eq!(AttemptState::sources_of(Succeeded), vec![Running, Cancelling]);
        assert_eq!(AttemptState::sources_of(Failed), vec![Running, Cancelling]);
        assert_eq!(AttemptState::sources_of(Cancelling), vec![Running]);
        assert_eq!(AttemptState::sources_of(Cancelled), vec![Queued, Cancelling]);
        assert_eq!(AttemptState::sources_of(Queued), vec![Running]);
    }

    #[test]
    fn terminal_states() {
        assert!(AttemptState::Succeeded.is_terminal());
        assert!(AttemptState::Failed.is_terminal());
        assert!(AttemptState::Cancelled.is_terminal());
        assert!(!AttemptState::Queued.is_terminal());
        assert!(!AttemptState::Running.is_terminal());
        assert!(!AttemptState::Cancelling.is_terminal());
    }

    #[test]
    fn persisted_names_roundtrip() {
        for state in AttemptState::ALL {
            assert_eq!(state.as_str().parse::<AttemptState>().unwrap(), state);
            assert_eq!(serde_json::to_value(state).unwrap(), state.as_str());
        }
        assert!("queued".parse::<AttemptState>().is_err());
    }

    #[test]
    fn new_attempt_is_queued_and_unclaimed() {
        let attempt = Attempt::new(Uuid::new_v4(), 1).with_correlation_id("req-7");
        assert_eq!(attempt.state, AttemptState::Queued);
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.correlation_id.as_deref(), Some("req-7"));
        assert!(attempt.started_at.is_none());
        assert!(attempt.claimed_by.is_none());
    }
}
