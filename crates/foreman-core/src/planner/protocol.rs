//! Wire protocol for planning-model exchanges.
//!
//! Every response is wrapped in an envelope:
//!
//! ```yaml
//! type: <operation_tag>
//! version: 1
//! payload: { ... }
//! ```
//!
//! Payloads are decoded through `serde_yaml::Value` so JSON and YAML
//! responses flow through the same path (YAML is a superset of JSON).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use foreman_store::models::AcceptanceCriterion;

use super::error::PlannerError;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Operation tags carried in the envelope `type` field.
pub mod operation {
    pub const DECOMPOSE: &str = "decompose";
    pub const PLAN_PATCH: &str = "plan_patch";
    pub const PLAN_TASK: &str = "plan_task";
    pub const NEXT_ACTION: &str = "next_action";
    pub const COMPLETION_ASSESSMENT: &str = "completion_assessment";
}

/// Common wrapper for all planning-model messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaMessage {
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub payload: serde_yaml::Value,
}

fn default_version() -> u32 {
    1
}

impl MetaMessage {
    /// Decode the payload as `T`, checking the operation tag first.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(
        self,
        expected: &'static str,
    ) -> Result<T, PlannerError> {
        if self.tag != expected {
            return Err(PlannerError::UnexpectedType {
                expected,
                got: self.tag,
            });
        }
        serde_yaml::from_value(self.payload)
            .map_err(|e| PlannerError::MalformedPayload(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Decompose
// ---------------------------------------------------------------------------

/// A chat message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A compact view of an existing task, included in prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFacet {
    pub id: String,
    pub title: String,
    pub status: String,
}

/// Workspace context shipped with decompose / plan-patch requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceContext {
    #[serde(default)]
    pub workspace_path: String,
    #[serde(default)]
    pub existing_tasks: Vec<TaskFacet>,
    /// One-line-per-node overview of the existing WBS, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wbs_overview: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<ChatMessage>,
}

/// Request for [`super::Planner::decompose`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeRequest {
    pub user_input: String,
    #[serde(default)]
    pub context: WorkspaceContext,
}

/// A task proposed by decomposition. `temp_id` is only meaningful within
/// the same response; dependencies may reference sibling temp IDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    #[serde(rename = "id")]
    pub temp_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// One ordered phase of the decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedPhase {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

/// Payload for operation tag `decompose`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeResponse {
    #[serde(default)]
    pub understanding: String,
    #[serde(default)]
    pub phases: Vec<PlannedPhase>,
    #[serde(default)]
    pub potential_conflicts: Vec<String>,
}

// ---------------------------------------------------------------------------
// Plan patch
// ---------------------------------------------------------------------------

/// Request for [`super::Planner::plan_patch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPatchRequest {
    pub user_input: String,
    #[serde(default)]
    pub context: WorkspaceContext,
}

/// The kind of a plan-patch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOpKind {
    Create,
    Update,
    Delete,
    Move,
}

impl fmt::Display for PatchOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Move => "move",
        };
        f.write_str(s)
    }
}

/// Sibling position for create/move: exactly one of `index`, `before`,
/// `after`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SiblingPosition {
    Index { index: usize },
    Before { before: String },
    After { after: String },
}

impl<'de> Deserialize<'de> for SiblingPosition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            index: Option<usize>,
            before: Option<String>,
            after: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        match (raw.index, raw.before, raw.after) {
            (Some(index), None, None) => Ok(Self::Index { index }),
            (None, Some(before), None) => Ok(Self::Before { before }),
            (None, None, Some(after)) => Ok(Self::After { after }),
            _ => Err(serde::de::Error::custom(
                "sibling position requires exactly one of index, before, after",
            )),
        }
    }
}

/// One operation in a plan patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOpKind,
    /// Target node for update/delete/move; assigned ID for create.
    pub node_id: String,
    /// Parent under which to create or move the node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<SiblingPosition>,
}

/// Payload for operation tag `plan_patch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPatchResponse {
    #[serde(default)]
    pub operations: Vec<PatchOperation>,
}

// ---------------------------------------------------------------------------
// Plan task
// ---------------------------------------------------------------------------

/// Payload for operation tag `plan_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTaskResponse {
    pub task_id: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
}

// ---------------------------------------------------------------------------
// Next action
// ---------------------------------------------------------------------------

/// The planner's decision for the next control-loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextActionKind {
    RunWorker,
    MarkComplete,
    AskHuman,
    Abort,
}

impl fmt::Display for NextActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RunWorker => "run_worker",
            Self::MarkComplete => "mark_complete",
            Self::AskHuman => "ask_human",
            Self::Abort => "abort",
        };
        f.write_str(s)
    }
}

/// The decision block of a next-action response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: NextActionKind,
    #[serde(default)]
    pub reason: String,
}

/// Worker invocation requested by the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCall {
    /// Agent CLI kind (e.g. "codex-cli", "claude-code").
    #[serde(default)]
    pub worker_type: String,
    #[serde(default)]
    pub mode: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default)]
    pub use_stdin: bool,
}

/// Payload for operation tag `next_action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextActionResponse {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_call: Option<WorkerCall>,
}

// ---------------------------------------------------------------------------
// Completion assessment
// ---------------------------------------------------------------------------

/// Per-criterion result of a completion assessment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub id: String,
    /// "passed" | "failed"
    pub status: String,
    #[serde(default)]
    pub comment: String,
}

/// Payload for operation tag `completion_assessment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionAssessmentResponse {
    pub all_criteria_satisfied: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub by_criterion: Vec<CriterionResult>,
}

// ---------------------------------------------------------------------------
// Task summary
// ---------------------------------------------------------------------------

/// Summary of one worker run, shipped in next-action prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRunSummary {
    pub id: String,
    pub exit_code: i32,
    #[serde(default)]
    pub summary: String,
}

/// Simplified view of a task handed to the planner for decisions and
/// assessments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub title: String,
    pub state: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub worker_runs_count: usize,
    #[serde(default)]
    pub worker_runs: Vec<WorkerRunSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_decodes_matching_tag() {
        let msg: MetaMessage = serde_yaml::from_str(
            "type: plan_task\nversion: 1\npayload:\n  task_id: t1\n  acceptance_criteria: []\n",
        )
        .unwrap();
        let plan: PlanTaskResponse = msg.decode_payload(operation::PLAN_TASK).unwrap();
        assert_eq!(plan.task_id, "t1");
    }

    #[test]
    fn envelope_rejects_wrong_tag() {
        let msg: MetaMessage =
            serde_yaml::from_str("type: decompose\nversion: 1\npayload: {}\n").unwrap();
        let err = msg
            .decode_payload::<PlanTaskResponse>(operation::PLAN_TASK)
            .unwrap_err();
        assert!(matches!(err, PlannerError::UnexpectedType { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn envelope_version_defaults_to_one() {
        let msg: MetaMessage =
            serde_yaml::from_str("type: decompose\npayload: {}\n").unwrap();
        assert_eq!(msg.version, 1);
    }

    #[test]
    fn next_action_parses_from_json() {
        let raw = r#"{
            "decision": {"action": "run_worker", "reason": "needs implementation"},
            "worker_call": {"worker_type": "codex-cli", "mode": "exec", "prompt": "do it"}
        }"#;
        let resp: NextActionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.decision.action, NextActionKind::RunWorker);
        let call = resp.worker_call.unwrap();
        assert_eq!(call.worker_type, "codex-cli");
        assert!(!call.use_stdin);
    }

    #[test]
    fn sibling_position_requires_exactly_one_field() {
        let index: SiblingPosition = serde_json::from_str(r#"{"index": 2}"#).unwrap();
        assert_eq!(index, SiblingPosition::Index { index: 2 });

        let before: SiblingPosition = serde_json::from_str(r#"{"before": "n1"}"#).unwrap();
        assert_eq!(before, SiblingPosition::Before { before: "n1".into() });

        let after: SiblingPosition = serde_json::from_str(r#"{"after": "n1"}"#).unwrap();
        assert_eq!(after, SiblingPosition::After { after: "n1".into() });

        assert!(serde_json::from_str::<SiblingPosition>(r#"{"index": 1, "before": "n1"}"#).is_err());
        assert!(serde_json::from_str::<SiblingPosition>("{}").is_err());
    }

    #[test]
    fn patch_operation_parses_move_with_position() {
        let raw = r#"{
            "op": "move",
            "node_id": "n3",
            "parent_id": "root",
            "position": {"after": "n1"}
        }"#;
        let op: PatchOperation = serde_json::from_str(raw).unwrap();
        assert_eq!(op.op, PatchOpKind::Move);
        assert_eq!(op.position, Some(SiblingPosition::After { after: "n1".into() }));
    }

    #[test]
    fn decompose_response_parses_temp_ids() {
        let raw = r#"
type: decompose
version: 1
payload:
  understanding: add auth
  phases:
    - name: Foundation
      tasks:
        - id: T1
          title: Add login form
          acceptance_criteria: ["form renders"]
        - id: T2
          title: Wire backend
          dependencies: [T1]
  potential_conflicts: []
"#;
        let msg: MetaMessage = serde_yaml::from_str(raw).unwrap();
        let resp: DecomposeResponse = msg.decode_payload(operation::DECOMPOSE).unwrap();
        assert_eq!(resp.phases.len(), 1);
        assert_eq!(resp.phases[0].tasks[1].dependencies, vec!["T1"]);
    }
}
