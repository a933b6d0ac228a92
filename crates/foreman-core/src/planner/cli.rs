//! Planner backend that shells out to a local planning CLI.
//!
//! The prompt is written to the CLI's stdin; the payload is extracted from
//! stdout, which may carry header noise (version banners, workdir lines)
//! before the envelope.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::error::PlannerError;
use super::extract::parse_meta_message;
use super::prompts;
use super::protocol::{
    CompletionAssessmentResponse, DecomposeRequest, DecomposeResponse, NextActionResponse,
    PlanPatchRequest, PlanPatchResponse, PlanTaskResponse, TaskSummary, operation,
};
use super::retry::{RetryPolicy, with_retry};
use super::{Planner, PlannerConfig};

/// Planner backend wrapping a planning-capable agent CLI.
pub struct CliPlanner {
    name: String,
    command: String,
    base_args: Vec<String>,
    model: Option<String>,
    timeout: Duration,
    policy: RetryPolicy,
}

impl CliPlanner {
    fn new(
        name: &str,
        default_command: &str,
        base_args: &[&str],
        config: &PlannerConfig,
    ) -> Self {
        let mut args: Vec<String> = base_args.iter().map(|s| s.to_string()).collect();
        args.extend(config.flags.iter().cloned());
        Self {
            name: name.to_owned(),
            command: config
                .cli_path
                .clone()
                .unwrap_or_else(|| default_command.to_owned()),
            base_args: args,
            model: config.model.clone(),
            timeout: config.timeout,
            policy: RetryPolicy::default(),
        }
    }

    /// `codex exec` in non-interactive mode.
    pub fn codex(config: &PlannerConfig) -> Self {
        Self::new("codex-cli", "codex", &["exec"], config)
    }

    /// `claude -p` print mode.
    pub fn claude_code(config: &PlannerConfig) -> Self {
        Self::new("claude-code", "claude", &["-p"], config)
    }

    /// Cursor's headless CLI.
    pub fn cursor(config: &PlannerConfig) -> Self {
        Self::new("cursor-cli", "cursor", &[], config)
    }

    /// One subprocess round trip, without retries.
    async fn call_once(&self, prompt: &str) -> Result<String, PlannerError> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.base_args);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| PlannerError::Transport(format!("failed to spawn {}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| PlannerError::Transport(format!("failed to write prompt: {e}")))?;
            // Close stdin so the CLI starts processing.
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| PlannerError::Timeout)?
            .map_err(|e| PlannerError::Transport(format!("failed to read output: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PlannerError::Transport(format!(
                "{} exited with {}: {}",
                self.command,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        op: &'static str,
        system: &str,
        user: &str,
    ) -> Result<T, PlannerError> {
        let prompt = format!("{system}\n\n{user}");
        debug!(op, cli = %self.command, "invoking planning CLI");
        let raw = with_retry(self.policy, op, || self.call_once(&prompt)).await?;
        parse_meta_message(&raw)?.decode_payload(op)
    }
}

#[async_trait::async_trait]
impl Planner for CliPlanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self) -> Result<(), PlannerError> {
        // Spawnability is the only meaningful probe for a local CLI.
        tokio::process::Command::new(&self.command)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| PlannerError::Transport(format!("{} not runnable: {e}", self.command)))
            .map(|_| ())
    }

    async fn decompose(&self, req: &DecomposeRequest) -> Result<DecomposeResponse, PlannerError> {
        self.call(
            operation::DECOMPOSE,
            prompts::DECOMPOSE_SYSTEM_PROMPT,
            &prompts::build_decompose_user_prompt(req),
        )
        .await
    }

    async fn plan_patch(
        &self,
        req: &PlanPatchRequest,
    ) -> Result<PlanPatchResponse, PlannerError> {
        self.call(
            operation::PLAN_PATCH,
            prompts::PLAN_PATCH_SYSTEM_PROMPT,
            &prompts::build_plan_patch_user_prompt(req),
        )
        .await
    }

    async fn plan_task(&self, prd_text: &str) -> Result<PlanTaskResponse, PlannerError> {
        self.call(
            operation::PLAN_TASK,
            prompts::PLAN_TASK_SYSTEM_PROMPT,
            &prompts::build_plan_task_user_prompt(prd_text),
        )
        .await
    }

    async fn next_action(
        &self,
        summary: &TaskSummary,
    ) -> Result<NextActionResponse, PlannerError> {
        self.call(
            operation::NEXT_ACTION,
            prompts::NEXT_ACTION_SYSTEM_PROMPT,
            &prompts::build_next_action_user_prompt(summary),
        )
        .await
    }

    async fn completion_assessment(
        &self,
        summary: &TaskSummary,
    ) -> Result<CompletionAssessmentResponse, PlannerError> {
        self.call(
            operation::COMPLETION_ASSESSMENT,
            prompts::COMPLETION_SYSTEM_PROMPT,
            &prompts::build_completion_user_prompt(summary),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_cli(dir: &std::path::Path, body: &str) -> String {
        let path = dir.join("fake_planner.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    fn planner_for(cli_path: String) -> CliPlanner {
        CliPlanner::codex(&PlannerConfig {
            backend: "codex-cli".into(),
            cli_path: Some(cli_path),
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn parses_payload_behind_header_noise() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            r#"echo "codex v1.2.3"
echo "workdir: /tmp"
echo '{"type":"plan_task","version":1,"payload":{"task_id":"t1","acceptance_criteria":[]}}'"#,
        );
        let planner = planner_for(cli);
        let plan = planner.plan_task("build the thing").await.unwrap();
        assert_eq!(plan.task_id, "t1");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "echo 'boom' >&2\nexit 3");
        let planner = CliPlanner {
            // Zero retries so the test does not sleep through backoff.
            policy: RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
            },
            ..planner_for(cli)
        };
        let err = planner.plan_task("x").await.unwrap_err();
        assert!(matches!(err, PlannerError::Transport(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn prompt_is_delivered_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        // The fake CLI echoes back a payload whose task_id is the first
        // word of the PRD line, proving stdin plumbed through.
        let cli = fake_cli(
            dir.path(),
            r#"id=$(grep -A1 '^PRD:' | head -2 | tail -1 | cut -d' ' -f1)
printf '{"type":"plan_task","version":1,"payload":{"task_id":"%s","acceptance_criteria":[]}}\n' "$id""#,
        );
        let planner = planner_for(cli);
        let plan = planner.plan_task("target-42 needs doing").await.unwrap();
        assert_eq!(plan.task_id, "target-42");
    }
}
