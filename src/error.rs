//! Error types for the attempt runner.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Attempt lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("Attempt {id} not found")]
    NotFound { id: Uuid },

    #[error("Attempt {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Faults raised by a step executor.
///
/// A fault is not the same as a step that ran and reported failure: it means
/// the executor could not produce a result at all. The orchestrator records
/// both as a failed step.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("Failed to spawn step process: {0}")]
    Spawn(String),

    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
