//! Step pipeline: the fixed sequence of steps every attempt runs.
//!
//! - `model`: step kinds, states and the step template
//! - `executor`: the contract a step implementation satisfies
//! - `registry`: kind → executor lookup
//! - `orchestrator`: creates steps and drives them in order
//! - `shell`: executor that runs a shell command

pub mod executor;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod shell;

pub use executor::{StepExecutor, StepOutcome};
pub use model::{RunStep, STEP_TEMPLATE, StepKind, StepState};
pub use orchestrator::{PipelineOrchestrator, PipelineOutcome};
pub use registry::ExecutorRegistry;
pub use shell::{ShellStepExecutor, shell_registry};
