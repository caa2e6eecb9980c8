use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use attempt_runner::attempts::AttemptQueue;
use attempt_runner::config::{self, StepCommands, WorkerConfig};
use attempt_runner::pipeline::{PipelineOrchestrator, shell_registry};
use attempt_runner::store::{Database, LibSqlBackend};
use attempt_runner::worker::WorkerLoop;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; the guard flushes file logs on exit
    let _log_guard = init_tracing();

    let worker_config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let commands = StepCommands::from_env().context("invalid step configuration")?;

    eprintln!("Attempt Runner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Worker: {}", worker_config.worker_id);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = config::database_path_from_env();
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&db_path)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    eprintln!("   Database: {}", db_path.display());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let registry = shell_registry(&commands);
    let mut kinds: Vec<String> = registry.kinds().iter().map(|k| k.to_string()).collect();
    kinds.sort();
    eprintln!(
        "   Executors: {}",
        if kinds.is_empty() {
            "none (all steps skipped)".to_string()
        } else {
            kinds.join(", ")
        }
    );
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        Arc::clone(&db),
        Arc::new(registry),
    ));

    // ── Worker ───────────────────────────────────────────────────────────
    let queue = AttemptQueue::new(Arc::clone(&db), worker_config.worker_id.clone());
    let grace = worker_config.shutdown_grace;
    let worker = Arc::new(WorkerLoop::new(queue, orchestrator, worker_config));

    let cancel = CancellationToken::new();
    let handles = worker.spawn(cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, waiting for in-flight attempt");
    cancel.cancel();

    if tokio::time::timeout(grace, handles.join()).await.is_err() {
        // Left Running; another worker's stale sweep requeues it.
        tracing::warn!(
            grace_secs = grace.as_secs(),
            "In-flight attempt did not finish within grace period, abandoning"
        );
    }

    tracing::info!("Attempt Runner stopped");
    Ok(())
}

/// Log to stderr, and to daily rolling files when `ATTEMPT_RUNNER_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match config::log_dir_from_env() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "attempt-runner.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
