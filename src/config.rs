//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::ConfigError;

/// Worker loop configuration.
///
/// Every interval is independent: the poll loop, the heartbeat ticker and the
/// stale sweep each run on their own timer.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier stamped on claimed attempts.
    pub worker_id: String,
    /// Sleep between empty dequeues.
    pub poll_interval: Duration,
    /// Heartbeat write interval while an attempt is running.
    pub heartbeat_interval: Duration,
    /// Interval of the stale-attempt sweep.
    pub stale_check_interval: Duration,
    /// Heartbeat age after which a running attempt is considered abandoned.
    pub stale_timeout: Duration,
    /// How long shutdown waits for an in-flight attempt before abandoning it.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            stale_check_interval: Duration::from_secs(60), // 1 minute
            stale_timeout: Duration::from_secs(120),       // 2 minutes
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Build from `ATTEMPT_RUNNER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let worker_id = std::env::var("ATTEMPT_RUNNER_WORKER_ID")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.worker_id);

        Ok(Self {
            worker_id,
            poll_interval: env_secs("ATTEMPT_RUNNER_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            heartbeat_interval: env_secs("ATTEMPT_RUNNER_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            stale_check_interval: env_secs(
                "ATTEMPT_RUNNER_STALE_CHECK_SECS",
                defaults.stale_check_interval,
            )?,
            stale_timeout: env_secs("ATTEMPT_RUNNER_STALE_TIMEOUT_SECS", defaults.stale_timeout)?,
            shutdown_grace: env_secs("ATTEMPT_RUNNER_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
        })
    }

    /// Builder: set the worker id.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Builder: set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder: set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Builder: set the stale sweep interval and timeout.
    pub fn with_stale_recovery(mut self, check_interval: Duration, timeout: Duration) -> Self {
        self.stale_check_interval = check_interval;
        self.stale_timeout = timeout;
        self
    }
}

/// Shell commands backing the process-driven step kinds.
///
/// A kind without a command gets no executor and is skipped by the pipeline.
#[derive(Debug, Clone)]
pub struct StepCommands {
    pub restore: Option<String>,
    pub build: Option<String>,
    pub test: Option<String>,
    /// Working directory for every command (process cwd if unset).
    pub working_dir: Option<PathBuf>,
    /// Per-step timeout enforced by the shell executor.
    pub timeout: Duration,
}

impl Default for StepCommands {
    fn default() -> Self {
        Self {
            restore: None,
            build: None,
            test: None,
            working_dir: None,
            timeout: Duration::from_secs(1800), // 30 minutes
        }
    }
}

impl StepCommands {
    /// Read step commands from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            restore: env_command("ATTEMPT_RUNNER_RESTORE_CMD"),
            build: env_command("ATTEMPT_RUNNER_BUILD_CMD"),
            test: env_command("ATTEMPT_RUNNER_TEST_CMD"),
            working_dir: std::env::var("ATTEMPT_RUNNER_WORKDIR").ok().map(PathBuf::from),
            timeout: env_secs("ATTEMPT_RUNNER_STEP_TIMEOUT_SECS", defaults.timeout)?,
        })
    }
}

/// Default location of the database file.
pub const DEFAULT_DB_PATH: &str = "./data/attempt-runner.db";

/// Database path from `ATTEMPT_RUNNER_DB_PATH`.
pub fn database_path_from_env() -> PathBuf {
    std::env::var("ATTEMPT_RUNNER_DB_PATH")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH))
}

/// Directory for rolling log files, if `ATTEMPT_RUNNER_LOG_DIR` is set.
pub fn log_dir_from_env() -> Option<PathBuf> {
    std::env::var("ATTEMPT_RUNNER_LOG_DIR")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
}

fn env_command(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Upper bound for any configured interval or timeout (one week).
const MAX_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_secs(key, &raw).map(Duration::from_secs),
        Err(_) => Ok(default),
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<u64, ConfigError> {
    let secs = u64::from_str(raw.trim()).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected whole seconds, got {raw:?}: {e}"),
    })?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    if secs > MAX_INTERVAL_SECS {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be at most {MAX_INTERVAL_SECS} seconds"),
        });
    }
    Ok(secs)
}
