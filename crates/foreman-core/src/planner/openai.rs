//! OpenAI-compatible chat backend for the planner.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::PlannerError;
use super::extract::parse_meta_message;
use super::prompts;
use super::protocol::{
    CompletionAssessmentResponse, DecomposeRequest, DecomposeResponse, NextActionResponse,
    PlanPatchRequest, PlanPatchResponse, PlanTaskResponse, TaskSummary, operation,
};
use super::retry::{RetryPolicy, with_retry};
use super::{Planner, PlannerConfig};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Planner backend speaking the OpenAI chat-completions protocol.
pub struct OpenAiPlanner {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    policy: RetryPolicy,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OpenAiPlanner {
    pub fn new(config: &PlannerConfig) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            api_key: config.api_key.clone(),
            policy: RetryPolicy::default(),
        })
    }

    fn classify(err: reqwest::Error) -> PlannerError {
        if err.is_timeout() {
            PlannerError::Timeout
        } else {
            PlannerError::Transport(err.to_string())
        }
    }

    /// One chat round trip, without retries.
    async fn call_once(&self, system: &str, user: &str) -> Result<String, PlannerError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let mut request = self.client.post(&self.base_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(Self::classify)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(PlannerError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| PlannerError::Transport(format!("invalid chat response: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PlannerError::MalformedPayload("no choices returned".to_owned()))?;
        Ok(choice.message.content)
    }

    /// Chat with retries, then extract and decode the expected payload.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        op: &'static str,
        system: &str,
        user: &str,
    ) -> Result<T, PlannerError> {
        debug!(op, model = %self.model, request_size = user.len(), "calling planning model");
        let raw = with_retry(self.policy, op, || self.call_once(system, user)).await?;
        info!(op, response_size = raw.len(), "planning model call completed");
        parse_meta_message(&raw)?.decode_payload(op)
    }
}

#[async_trait::async_trait]
impl Planner for OpenAiPlanner {
    fn name(&self) -> &str {
        "openai-chat"
    }

    async fn test_connection(&self) -> Result<(), PlannerError> {
        // A minimal decompose round trip doubles as the reachability probe.
        self.decompose(&DecomposeRequest {
            user_input: "Ping".to_owned(),
            context: Default::default(),
        })
        .await
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
