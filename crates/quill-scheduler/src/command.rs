//! Subprocess-backed collaborators.
//!
//! Each collaborator call runs a configured shell command. The job being
//! executed is written to the command's stdin as JSON, and the command
//! reports its outcome as a JSON object on the last line of stdout:
//!
//! ```json
//! {"success": false, "error": "captcha shown", "category": "account", "type": "captcha"}
//! ```
//!
//! The worker id is exported as `QUILL_WORKER_ID` so a command can pick the
//! device it drives.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use quill_ledger::{ErrorCategory, Job, NewJob};

use crate::SchedulerError;
use crate::backend::{BackendHealth, ExecutionResult, JobExecutor, JobSource};

/// Default limit for one job execution.
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(600);
/// Default limit for a health probe.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Default limit for a backend restart.
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(180);

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT: usize = 300;

enum CommandFailure {
    Spawn(std::io::Error),
    Timeout(Duration),
}

/// Runs shell commands for execution, health checks and restarts.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    execute_cmd: String,
    health_cmd: Option<String>,
    restart_cmd: Option<String>,
    execute_timeout: Duration,
    health_timeout: Duration,
    restart_timeout: Duration,
}

impl CommandBackend {
    pub fn new(execute_cmd: impl Into<String>) -> Self {
        Self {
            execute_cmd: execute_cmd.into(),
            health_cmd: None,
            restart_cmd: None,
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
        }
    }

    /// Command whose exit status decides backend health.
    pub fn with_health_cmd(mut self, cmd: Option<String>) -> Self {
        self.health_cmd = cmd.filter(|c| !c.trim().is_empty());
        self
    }

    /// Command that restarts the backend; exit status decides success.
    pub fn with_restart_cmd(mut self, cmd: Option<String>) -> Self {
        self.restart_cmd = cmd.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_restart_timeout(mut self, timeout: Duration) -> Self {
        self.restart_timeout = timeout;
        self
    }

    async fn run(
        &self,
        cmd: &str,
        worker_id: &str,
        stdin: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Output, CommandFailure> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .env("QUILL_WORKER_ID", worker_id)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandFailure::Spawn)?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            // A command that ignores stdin may exit before reading it.
            if let Err(e) = pipe.write_all(&bytes).await {
                debug!(error = %e, "command did not read its stdin");
            }
        }

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CommandFailure::Spawn(e)),
            Err(_) => Err(CommandFailure::Timeout(timeout)),
        }
    }

    async fn run_status(&self, cmd: &str, worker_id: &str, timeout: Duration, what: &str) -> bool {
        match self.run(cmd, worker_id, None, timeout).await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    worker_id,
                    status = %output.status,
                    stderr = %stderr_excerpt(&output),
                    "backend {what} command failed"
                );
                false
            }
            Err(CommandFailure::Spawn(e)) => {
                warn!(worker_id, error = %e, "could not run backend {what} command");
                false
            }
            Err(CommandFailure::Timeout(t)) => {
                warn!(worker_id, timeout_secs = t.as_secs(), "backend {what} command timed out");
                false
            }
        }
    }
}

#[async_trait]
impl JobExecutor for CommandBackend {
    async fn execute(&self, worker_id: &str, job: &Job) -> ExecutionResult {
        let payload = match serde_json::to_vec(job) {
            Ok(payload) => payload,
            Err(e) => return ExecutionResult::failure(format!("could not encode job: {e}")),
        };

        let output = match self
            .run(&self.execute_cmd, worker_id, Some(payload), self.execute_timeout)
            .await
        {
            Ok(output) => output,
            Err(CommandFailure::Spawn(e)) => {
                return ExecutionResult::classified(
                    format!("could not run execute command: {e}"),
                    ErrorCategory::Infrastructure,
                    "backend_crash",
                );
            }
            Err(CommandFailure::Timeout(t)) => {
                return ExecutionResult::classified(
                    format!("execute command timed out after {}s", t.as_secs()),
                    ErrorCategory::Infrastructure,
                    "timeout",
                );
            }
        };

        parse_execution_output(&output)
    }
}

#[async_trait]
impl BackendHealth for CommandBackend {
    async fn health_check(&self, worker_id: &str) -> bool {
        match &self.health_cmd {
            Some(cmd) => {
                self.run_status(cmd, worker_id, self.health_timeout, "health")
                    .await
            }
            None => true,
        }
    }

    async fn restart(&self, worker_id: &str) -> bool {
        match &self.restart_cmd {
            Some(cmd) => {
                self.run_status(cmd, worker_id, self.restart_timeout, "restart")
                    .await
            }
            None => true,
        }
    }
}

/// Interpret an execute command's output: the last stdout line that parses
/// as a result wins; otherwise the exit status and stderr describe a failure.
fn parse_execution_output(output: &Output) -> ExecutionResult {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let reported = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str::<ExecutionResult>(line).ok());

    match reported {
        Some(result) => {
            if !result.success && result.error.is_empty() {
                return ExecutionResult {
                    error: format!("job failed ({})", output.status),
                    ..result
                };
            }
            result
        }
        None if output.status.success() => {
            ExecutionResult::failure("execute command exited without reporting a result")
        }
        None => {
            let stderr = stderr_excerpt(output);
            if stderr.is_empty() {
                ExecutionResult::failure(format!("execute command failed ({})", output.status))
            } else {
                ExecutionResult::failure(stderr)
            }
        }
    }
}

fn stderr_excerpt(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    match trimmed.char_indices().nth(STDERR_EXCERPT) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

/// Reads desired work from a JSON file: `[{"account": "...", "payload_ref": "..."}]`.
#[derive(Debug, Clone)]
pub struct FileJobSource {
    path: PathBuf,
}

impl FileJobSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobSource for FileJobSource {
    async fn source_jobs(&self) -> Result<Vec<NewJob>, SchedulerError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SchedulerError::Collaborator(format!(
                "could not read jobs file {}: {e}",
                self.path.display()
            ))
        })?;
        let jobs: Vec<NewJob> = serde_json::from_str(&raw)?;
        debug!(path = %self.path.display(), count = jobs.len(), "loaded sourced jobs");
        Ok(jobs)
    }
}
