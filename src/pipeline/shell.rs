//! Shell-command step executor.
//!
//! Runs a configured command through `sh -c` (or `cmd /C` on Windows) and maps
//! its exit status onto a [`StepOutcome`]. Used for the process-driven step
//! kinds such as restore, build and test.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::attempts::model::Attempt;
use crate::config::StepCommands;
use crate::error::StepError;
use crate::pipeline::executor::{StepExecutor, StepOutcome};
use crate::pipeline::model::{RunStep, StepKind};
use crate::pipeline::registry::ExecutorRegistry;

/// Maximum captured output size (64 KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Executes one step kind by running a shell command.
#[derive(Debug, Clone)]
pub struct ShellStepExecutor {
    kind: StepKind,
    command: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellStepExecutor {
    pub fn new(kind: StepKind, command: impl Into<String>) -> Self {
        Self {
            kind,
            command: command.into(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command, returning combined output and exit code.
    async fn run(&self, attempt: &Attempt) -> Result<(String, i32), StepError> {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &self.command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &self.command]);
            c
        };

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command
            .env("ATTEMPT_ID", attempt.id.to_string())
            .env("TASK_ID", attempt.task_id.to_string())
            .env("ATTEMPT_NUMBER", attempt.attempt_number.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| StepError::Spawn(format!("{}: {e}", truncate_for_error(&self.command))))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes are drained while waiting so a chatty command never
        // blocks on a full pipe.
        let result = tokio::time::timeout(self.timeout, async {
            tokio::try_join!(capture(stdout), capture(stderr), child.wait())
        })
        .await;

        let (stdout, stderr, status) = match result {
            Ok(captured) => captured?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(StepError::Timeout(self.timeout));
            }
        };

        let stdout = stdout.render();
        let stderr = stderr.render();
        let combined = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{stdout}\n\n--- stderr ---\n{stderr}")
        };

        Ok((truncate_output(&combined), status.code().unwrap_or(-1)))
    }
}

/// Output of one stream, bounded to `MAX_OUTPUT_SIZE` bytes.
///
/// Keeps the first and last halves and counts what was dropped in between.
#[derive(Debug, Default)]
struct CapturedStream {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    dropped: usize,
}

impl CapturedStream {
    fn push(&mut self, mut chunk: &[u8]) {
        let half = MAX_OUTPUT_SIZE / 2;
        if self.head.len() < half {
            let take = chunk.len().min(half - self.head.len());
            self.head.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
        }
        self.tail.extend(chunk);
        if self.tail.len() > half {
            let excess = self.tail.len() - half;
            self.tail.drain(..excess);
            self.dropped += excess;
        }
    }

    fn render(&self) -> String {
        let head = String::from_utf8_lossy(&self.head);
        let tail: Vec<u8> = self.tail.iter().copied().collect();
        let tail = String::from_utf8_lossy(&tail);
        if self.dropped == 0 {
            format!("{head}{tail}")
        } else {
            format!(
                "{head}\n\n... [truncated {} bytes] ...\n\n{tail}",
                self.dropped
            )
        }
    }
}

/// Read a child pipe to EOF, keeping at most `MAX_OUTPUT_SIZE` bytes.
async fn capture<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<CapturedStream> {
    let mut captured = CapturedStream::default();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(captured);
        }
        captured.push(&buf[..n]);
    }
}

#[async_trait]
impl StepExecutor for ShellStepExecutor {
    fn kind(&self) -> StepKind {
        self.kind.clone()
    }

    async fn execute(&self, step: &RunStep, attempt: &Attempt) -> Result<StepOutcome, StepError> {
        debug!(
            step_id = %step.id,
            kind = %self.kind,
            command = %truncate_for_error(&self.command),
            "Running step command"
        );

        let (output, code) = self.run(attempt).await?;

        let outcome = if code == 0 {
            StepOutcome::succeeded()
        } else {
            StepOutcome::failed(format!("{} exited with code {code}", step.name))
        };
        Ok(outcome.with_output(output).with_exit_code(code))
    }
}

/// Build a registry with a shell executor for every configured command.
///
/// Kinds without a command are left unregistered and get skipped.
pub fn shell_registry(commands: &StepCommands) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    let configured = [
        (StepKind::Restore, &commands.restore),
        (StepKind::Build, &commands.build),
        (StepKind::Test, &commands.test),
    ];

    for (kind, command) in configured {
        let Some(command) = command else { continue };
        let mut executor =
            ShellStepExecutor::new(kind, command.clone()).with_timeout(commands.timeout);
        if let Some(dir) = &commands.working_dir {
            executor = executor.with_working_dir(dir.clone());
        }
        registry.register(Arc::new(executor));
    }
    registry
}

/// Truncate output to fit within limits (UTF-8 safe), keeping head and tail.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        tail_start - head_end,
        &s[tail_start..]
    )
}

/// Largest byte index <= `i` on a char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn step_and_attempt(kind: StepKind) -> (RunStep, Attempt) {
        let attempt = Attempt::new(Uuid::new_v4(), 3);
        let step = RunStep::new(attempt.id, kind, "Build", 2);
        (step, attempt)
    }

    #[tokio::test]
    async fn zero_exit_succeeds_with_output() {
        let executor = ShellStepExecutor::new(StepKind::Build, "echo hello");
        let (step, attempt) = step_and_attempt(StepKind::Build);

        let outcome = executor.execute(&step, &attempt).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.output.unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_with_stderr() {
        let executor = ShellStepExecutor::new(StepKind::Build, "echo broken >&2; exit 3");
        let (step, attempt) = step_and_attempt(StepKind::Build);

        let outcome = executor.execute(&step, &attempt).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Build exited with code 3")
        );
        assert!(outcome.output.unwrap().contains("broken"));
    }

    #[tokio::test]
    async fn attempt_context_is_exported() {
        let executor = ShellStepExecutor::new(StepKind::Test, "echo \"$ATTEMPT_NUMBER:$TASK_ID\"");
        let (step, attempt) = step_and_attempt(StepKind::Test);

        let outcome = executor.execute(&step, &attempt).await.unwrap();
        let output = outcome.output.unwrap();
        assert!(output.contains(&format!("3:{}", attempt.task_id)));
    }

    #[tokio::test]
    async fn working_dir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let executor = ShellStepExecutor::new(StepKind::Restore, "ls")
            .with_working_dir(dir.path().to_path_buf());
        let (step, attempt) = step_and_attempt(StepKind::Restore);

        let outcome = executor.execute(&step, &attempt).await.unwrap();
        assert!(outcome.output.unwrap().contains("marker.txt"));
    }

    #[tokio::test]
    async fn timeout_is_a_fault() {
        let executor = ShellStepExecutor::new(StepKind::Test, "sleep 10")
            .with_timeout(Duration::from_millis(100));
        let (step, attempt) = step_and_attempt(StepKind::Test);

        let result = executor.execute(&step, &attempt).await;
        assert!(matches!(result, Err(StepError::Timeout(_))));
    }

    #[test]
    fn registry_only_has_configured_kinds() {
        let commands = StepCommands {
            restore: Some("npm ci".into()),
            test: Some("npm test".into()),
            ..Default::default()
        };
        let registry = shell_registry(&commands);
        assert_eq!(registry.len(), 2);
        assert!(registry.has(&StepKind::Restore));
        assert!(!registry.has(&StepKind::Build));
        assert!(registry.has(&StepKind::Test));
    }

    #[test]
    fn long_output_is_truncated() {
        let long = "a".repeat(MAX_OUTPUT_SIZE * 2);
        let truncated = truncate_output(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("[truncated"));
        assert_eq!(truncate_output("short"), "short");
    }

    #[test]
    fn captured_stream_keeps_head_and_tail() {
        let mut captured = CapturedStream::default();
        captured.push(b"start-");
        for _ in 0..64 {
            captured.push(&[b'x'; 4096]);
        }
        captured.push(b"-end");

        assert_eq!(captured.head.len() + captured.tail.len(), MAX_OUTPUT_SIZE);
        let rendered = captured.render();
        assert!(rendered.starts_with("start-"));
        assert!(rendered.ends_with("-end"));
        assert!(rendered.contains("[truncated"));
    }

    #[tokio::test]
    async fn noisy_command_output_stays_bounded() {
        // Several megabytes on each stream, well past what a pipe buffers.
        let executor = ShellStepExecutor::new(
            StepKind::Build,
            "head -c 4000000 /dev/zero | tr '\\0' a; head -c 4000000 /dev/zero | tr '\\0' b >&2; echo done",
        );
        let (step, attempt) = step_and_attempt(StepKind::Build);

        let outcome = executor.execute(&step, &attempt).await.unwrap();
        assert!(outcome.success);
        let output = outcome.output.unwrap();
        assert!(output.len() < MAX_OUTPUT_SIZE + 256);
        assert!(output.contains("[truncated"));
        assert!(output.trim_end().ends_with('b'));
    }
}
