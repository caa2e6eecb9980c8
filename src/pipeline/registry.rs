//! Registry mapping step kinds to their executors.

use std::collections::HashMap;
use std::sync::Arc;

use crate::pipeline::executor::StepExecutor;
use crate::pipeline::model::StepKind;

/// Step executors keyed by the kind they declare.
///
/// Populated at startup and read-only afterwards. A kind with no executor is
/// skipped by the pipeline, so partial deployments can leave kinds unwired.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StepKind, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its declared kind.
    ///
    /// The first executor registered for a kind wins; later ones are ignored.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) -> bool {
        let kind = executor.kind();
        if self.executors.contains_key(&kind) {
            tracing::warn!(kind = %kind, "Executor already registered for step kind, ignoring");
            return false;
        }
        tracing::debug!("Registered step executor: {}", kind);
        self.executors.insert(kind, executor);
        true
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.register(executor);
        self
    }

    /// Get the executor for a kind.
    pub fn get(&self, kind: &StepKind) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(kind).cloned()
    }

    /// Check if a kind has an executor.
    pub fn has(&self, kind: &StepKind) -> bool {
        self.executors.contains_key(kind)
    }

    /// List registered kinds.
    pub fn kinds(&self) -> Vec<StepKind> {
        self.executors.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
