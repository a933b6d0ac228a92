//! The sandbox-worker executor: one persistent sandbox per task.
//!
//! `start` brings the sandbox up, `run_worker` issues one agent CLI run
//! inside it with a wall-clock timeout, `stop` tears it down. A non-zero
//! agent exit code is reported in the result; the executor errors only for
//! its own lifecycle misuse.

pub mod agent_cli;
pub mod sandbox;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::planner::protocol::WorkerCall;
pub use agent_cli::{CliKind, ExecPlan, build_exec_plan};
pub use sandbox::{ContainerSandbox, ExecOutcome, LocalSandbox, Sandbox, SandboxError, create_sandbox};

/// Default wall-clock limit for one worker run (30 minutes).
pub const DEFAULT_MAX_RUN_TIME: Duration = Duration::from_secs(1800);

/// Lifecycle errors of the executor itself. Agent failures are not errors;
/// they surface as [`WorkerRunResult::exit_code`] / [`WorkerRunResult::error`].
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("sandbox already started (id: {0})")]
    AlreadyStarted(String),

    #[error("sandbox not started: call start() first")]
    NotStarted,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Outcome of one worker run.
#[derive(Debug, Clone)]
pub struct WorkerRunResult {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: i32,
    pub raw_output: String,
    pub summary: String,
    /// Sandbox-level fault, if any. Reserved for executor faults; agent
    /// failures show up as a non-zero exit code instead.
    pub error: Option<String>,
}

/// Configuration for the worker executor.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Default agent CLI kind when a worker call does not name one.
    pub cli: CliKind,
    pub max_run_time: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cli: CliKind::Codex,
            max_run_time: DEFAULT_MAX_RUN_TIME,
        }
    }
}

/// Drives agent CLI runs inside one persistent sandbox.
pub struct WorkerExecutor {
    config: WorkerConfig,
    sandbox: Arc<dyn Sandbox>,
    repo_path: PathBuf,
    sandbox_id: Option<String>,
}

impl WorkerExecutor {
    pub fn new(config: WorkerConfig, sandbox: Arc<dyn Sandbox>, repo_path: PathBuf) -> Self {
        Self {
            config,
            sandbox,
            repo_path,
            sandbox_id: None,
        }
    }

    /// Bring up the sandbox. A second `start` is an error.
    pub async fn start(&mut self) -> Result<(), WorkerError> {
        if let Some(id) = &self.sandbox_id {
            return Err(WorkerError::AlreadyStarted(id.clone()));
        }
        let id = self.sandbox.start(&self.repo_path).await?;
        info!(sandbox_id = %id, backend = self.sandbox.name(), "worker sandbox started");
        self.sandbox_id = Some(id);
        Ok(())
    }

    /// Run the agent CLI once with the call's prompt and env. Never retries.
    ///
    /// Timeouts and sandbox faults are reported in the result's `error`
    /// field with exit code -1.
    pub async fn run_worker(&self, call: &WorkerCall) -> Result<WorkerRunResult, WorkerError> {
        let sandbox_id = self.sandbox_id.as_deref().ok_or(WorkerError::NotStarted)?;

        let started_at = Utc::now();
        let run_id = format!("run-{}", started_at.timestamp_nanos_opt().unwrap_or_default());

        let plan = match build_exec_plan(call, self.config.cli) {
            Ok(plan) => plan,
            Err(e) => {
                return Ok(self.faulted(run_id, started_at, format!("bad worker call: {e}")));
            }
        };

        // Env vars ride on argv via `env` so both sandbox backends inherit
        // them uniformly.
        let argv = if plan.env.is_empty() {
            plan.argv.clone()
        } else {
            let mut argv = vec!["env".to_owned()];
            let mut pairs: Vec<_> = plan.env.iter().collect();
            pairs.sort();
            argv.extend(pairs.into_iter().map(|(k, v)| format!("{k}={v}")));
            argv.extend(plan.argv.iter().cloned());
            argv
        };

        let exec = self.sandbox.exec(sandbox_id, &argv, plan.stdin.as_deref());
        let outcome = match tokio::time::timeout(self.config.max_run_time, exec).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(run_id = %run_id, error = %e, "sandbox exec failed");
                return Ok(self.faulted(run_id, started_at, format!("sandbox exec: {e}")));
            }
            Err(_) => {
                warn!(run_id = %run_id, "worker run timed out");
                return Ok(self.faulted(
                    run_id,
                    started_at,
                    format!(
                        "worker run timed out after {}s",
                        self.config.max_run_time.as_secs()
                    ),
                ));
            }
        };

        Ok(WorkerRunResult {
            summary: summarize_output(&outcome.output, outcome.exit_code),
            id: run_id,
            started_at,
            finished_at: Utc::now(),
            exit_code: outcome.exit_code,
            raw_output: outcome.output,
            error: None,
        })
    }

    /// Tear the sandbox down. The stored ID is cleared before the teardown
    /// call so a failed teardown still prevents reuse.
    pub async fn stop(&mut self) -> Result<(), WorkerError> {
        let id = self.sandbox_id.take().ok_or(WorkerError::NotStarted)?;
        self.sandbox.stop(&id).await?;
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.sandbox_id.is_some()
    }

    fn faulted(
        &self,
        run_id: String,
        started_at: DateTime<Utc>,
        message: String,
    ) -> WorkerRunResult {
        WorkerRunResult {
            id: run_id,
            started_at,
            finished_at: Utc::now(),
            exit_code: -1,
            raw_output: String::new(),
            summary: message.clone(),
            error: Some(message),
        }
    }
}

/// One-line summary of a run: the last non-empty output line, truncated.
fn summarize_output(output: &str, exit_code: i32) -> String {
    let last_line = output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim();
    let mut summary = if last_line.is_empty() {
        format!("worker exited with code {exit_code}")
    } else {
        last_line.to_owned()
    };
    if summary.len() > 200 {
        let mut end = 200;
        while !summary.is_char_boundary(end) {
            end -= 1;
        }
        summary.truncate(end);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_agent(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake_agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    fn worker_call(cli_path: String, prompt: &str) -> WorkerCall {
        WorkerCall {
            worker_type: "codex-cli".to_owned(),
            cli_path: Some(cli_path),
            prompt: prompt.to_owned(),
            ..Default::default()
        }
    }

    async fn started_executor(dir: &std::path::Path) -> WorkerExecutor {
        let mut executor = WorkerExecutor::new(
            WorkerConfig::default(),
            Arc::new(LocalSandbox::new()),
            dir.to_path_buf(),
        );
        executor.start().await.unwrap();
        executor
    }

    #[tokio::test]
    async fn run_worker_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let executor = WorkerExecutor::new(
            WorkerConfig::default(),
            Arc::new(LocalSandbox::new()),
            dir.path().to_path_buf(),
        );
        let err = executor
            .run_worker(&worker_call("true".into(), "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::NotStarted));
    }

    #[tokio::test]
    async fn second_start_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = started_executor(dir.path()).await;
        assert!(matches!(
            executor.start().await.unwrap_err(),
            WorkerError::AlreadyStarted(_)
        ));
    }

    #[tokio::test]
    async fn successful_run_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_agent(dir.path(), "echo working...\necho done: all tests pass");
        let executor = started_executor(dir.path()).await;

        let result = executor
            .run_worker(&worker_call(cli, "implement feature"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.error.is_none());
        assert!(result.raw_output.contains("working..."));
        assert_eq!(result.summary, "done: all tests pass");
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_an_executor_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_agent(dir.path(), "echo build failed >&2\nexit 2");
        let executor = started_executor(dir.path()).await;

        let result = executor.run_worker(&worker_call(cli, "p")).await.unwrap();
        assert_eq!(result.exit_code, 2);
        assert!(result.error.is_none());
        assert!(result.raw_output.contains("build failed"));
    }

    #[tokio::test]
    async fn timeout_is_reported_in_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_agent(dir.path(), "sleep 30");
        let mut executor = WorkerExecutor::new(
            WorkerConfig {
                cli: CliKind::Codex,
                max_run_time: Duration::from_millis(100),
            },
            Arc::new(LocalSandbox::new()),
            dir.path().to_path_buf(),
        );
        executor.start().await.unwrap();

        let result = executor.run_worker(&worker_call(cli, "p")).await.unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn spawn_failure_is_a_sandbox_fault_in_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let executor = started_executor(dir.path()).await;
        let result = executor
            .run_worker(&worker_call("/nonexistent/agent".into(), "p"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.error.as_deref().unwrap().contains("sandbox exec"));
    }

    #[tokio::test]
    async fn env_vars_reach_the_agent() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_agent(dir.path(), "echo \"token=$AGENT_TOKEN\"");
        let executor = started_executor(dir.path()).await;

        let mut call = worker_call(cli, "p");
        call.env.insert("AGENT_TOKEN".to_owned(), "secret7".to_owned());
        let result = executor.run_worker(&call).await.unwrap();
        assert!(result.raw_output.contains("token=secret7"));
    }

    #[tokio::test]
    async fn stop_clears_id_before_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = started_executor(dir.path()).await;
        executor.stop().await.unwrap();
        assert!(!executor.is_started());
        // A second stop reports NotStarted, not a sandbox error.
        assert!(matches!(
            executor.stop().await.unwrap_err(),
            WorkerError::NotStarted
        ));
    }

    #[test]
    fn summaries_are_bounded() {
        let long = format!("prefix {}", "x".repeat(500));
        let summary = summarize_output(&long, 0);
        assert!(summary.len() <= 200);

        assert_eq!(summarize_output("", 3), "worker exited with code 3");
        assert_eq!(summarize_output("a\nb\n\n", 0), "b");
    }
}
