//! Step executor contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::attempts::model::Attempt;
use crate::error::StepError;
use crate::pipeline::model::{RunStep, StepKind};

/// Result of running one step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl StepOutcome {
    /// A successful step with no output.
    pub fn succeeded() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    /// An unsuccessful step with an error message.
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(error_message.into()),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }
}

/// Performs one kind of pipeline step.
///
/// Executors may run for a long time; the orchestrator awaits them with no
/// timeout of its own. Returning `Err` (or panicking) is recorded as a failed
/// step, exactly like an unsuccessful [`StepOutcome`].
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The step kind this executor handles.
    fn kind(&self) -> StepKind;

    /// Run the step. Must not assume exclusive access to the attempt.
    async fn execute(&self, step: &RunStep, attempt: &Attempt) -> Result<StepOutcome, StepError>;
}
