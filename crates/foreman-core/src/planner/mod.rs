//! The planning-model client: a typed adapter over an external decider.
//!
//! The `Planner` trait is the capability set; backends wrap an HTTP chat
//! API or a local planning CLI and normalize their output through the
//! tolerant payload extractor. Transient failures are retried with
//! exponential backoff.

pub mod error;
pub mod extract;
pub mod prompts;
pub mod protocol;
pub mod retry;

mod cli;
mod mock;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

pub use cli::CliPlanner;
pub use error::PlannerError;
pub use mock::MockPlanner;
pub use openai::OpenAiPlanner;
pub use retry::RetryPolicy;

use protocol::{
    CompletionAssessmentResponse, DecomposeRequest, DecomposeResponse, NextActionResponse,
    PlanPatchRequest, PlanPatchResponse, PlanTaskResponse, TaskSummary,
};

/// Adapter interface for planning-model backends.
///
/// Object-safe so backends can be stored as `Arc<dyn Planner>` and resolved
/// by name from configuration.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Backend name (e.g. "openai-chat", "codex-cli", "mock").
    fn name(&self) -> &str;

    /// Verify the backend is reachable and configured.
    async fn test_connection(&self) -> Result<(), PlannerError>;

    /// Break a user request into phases of tasks with dependencies.
    async fn decompose(&self, req: &DecomposeRequest) -> Result<DecomposeResponse, PlannerError>;

    /// Produce edit operations against the existing plan.
    async fn plan_patch(&self, req: &PlanPatchRequest)
    -> Result<PlanPatchResponse, PlannerError>;

    /// Derive acceptance criteria from a PRD.
    async fn plan_task(&self, prd_text: &str) -> Result<PlanTaskResponse, PlannerError>;

    /// Decide the next control-loop step for a task.
    async fn next_action(&self, summary: &TaskSummary)
    -> Result<NextActionResponse, PlannerError>;

    /// Judge whether a task satisfies its acceptance criteria.
    async fn completion_assessment(
        &self,
        summary: &TaskSummary,
    ) -> Result<CompletionAssessmentResponse, PlannerError>;
}

// Compile-time assertion: Planner must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Planner) {}
};

/// Configuration for constructing a planner backend.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Backend name: openai-chat, codex-cli, claude-code, cursor-cli, mock.
    pub backend: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    /// Override for the HTTP endpoint (openai-chat only).
    pub base_url: Option<String>,
    /// Override for the CLI binary path (CLI backends only).
    pub cli_path: Option<String>,
    /// Extra flags for CLI backends.
    pub flags: Vec<String>,
    pub timeout: Duration,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            backend: "openai-chat".to_owned(),
            model: None,
            api_key: None,
            base_url: None,
            cli_path: None,
            flags: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Factory: resolve a planner backend by name.
pub fn create_planner(config: &PlannerConfig) -> anyhow::Result<Arc<dyn Planner>> {
    match config.backend.as_str() {
        "openai-chat" => Ok(Arc::new(OpenAiPlanner::new(config)?)),
        "codex-cli" => Ok(Arc::new(CliPlanner::codex(config))),
        "claude-code" => Ok(Arc::new(CliPlanner::claude_code(config))),
        "cursor-cli" => Ok(Arc::new(CliPlanner::cursor(config))),
        "mock" => Ok(Arc::new(MockPlanner::default())),
        other => bail!(
            "unknown planner backend: {other:?} (expected openai-chat, codex-cli, claude-code, cursor-cli, or mock)"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_resolves_known_backends() {
        for backend in ["codex-cli", "claude-code", "cursor-cli", "mock"] {
            let config = PlannerConfig {
                backend: backend.to_owned(),
                ..Default::default()
            };
            let planner = create_planner(&config).unwrap();
            assert_eq!(planner.name(), backend);
        }
    }

    #[test]
    fn factory_rejects_unknown_backend() {
        let config = PlannerConfig {
            backend: "crystal-ball".to_owned(),
            ..Default::default()
        };
        assert!(create_planner(&config).is_err());
    }
}
