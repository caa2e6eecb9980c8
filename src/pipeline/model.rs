//! Run step data model.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of pipeline step. Executors are registered per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StepKind {
    Restore,
    Build,
    Test,
    Agent,
    Review,
    /// Open-ended script step, identified by name (persisted as `Script:<name>`).
    Script(String),
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Restore => f.write_str("Restore"),
            Self::Build => f.write_str("Build"),
            Self::Test => f.write_str("Test"),
            Self::Agent => f.write_str("Agent"),
            Self::Review => f.write_str("Review"),
            Self::Script(name) if name.is_empty() => f.write_str("Script"),
            Self::Script(name) => write!(f, "Script:{name}"),
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Restore" => Ok(Self::Restore),
            "Build" => Ok(Self::Build),
            "Test" => Ok(Self::Test),
            "Agent" => Ok(Self::Agent),
            "Review" => Ok(Self::Review),
            "Script" => Ok(Self::Script(String::new())),
            other => other
                .strip_prefix("Script:")
                .map(|name| Self::Script(name.to_string()))
                .ok_or_else(|| format!("unknown step kind: {other}")),
        }
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for StepKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// State of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Persisted string value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Running" => Ok(Self::Running),
            "Succeeded" => Ok(Self::Succeeded),
            "Failed" => Ok(Self::Failed),
            "Skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step state: {other}")),
        }
    }
}

/// The fixed pipeline every attempt runs, in sequence order.
pub const STEP_TEMPLATE: &[(StepKind, &str)] = &[
    (StepKind::Restore, "Restore dependencies"),
    (StepKind::Build, "Build"),
    (StepKind::Test, "Test"),
    (StepKind::Agent, "Agent"),
    (StepKind::Review, "Review"),
];

/// One stage of an attempt's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: Uuid,
    pub attempt_id: Uuid,
    pub kind: StepKind,
    pub name: String,
    pub state: StepState,
    /// 1-based execution order within the attempt.
    pub sequence: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl RunStep {
    /// Create a pending step.
    pub fn new(attempt_id: Uuid, kind: StepKind, name: impl Into<String>, sequence: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt_id,
            kind,
            name: name.into(),
            state: StepState::Pending,
            sequence,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            output: None,
            exit_code: None,
        }
    }
}
