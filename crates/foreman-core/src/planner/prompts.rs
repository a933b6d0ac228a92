//! Prompt construction for each planning operation.
//!
//! System prompts state the envelope contract; user prompts carry the
//! workspace context, truncated where history could blow the token budget.

use super::protocol::{DecomposeRequest, PlanPatchRequest, TaskSummary};

/// Truncation bound for conversation-history entries.
const HISTORY_CONTENT_LIMIT: usize = 300;
/// At most this many trailing conversation messages are included.
const HISTORY_MESSAGE_LIMIT: usize = 10;
/// At most this many existing tasks are listed in plan-patch prompts.
const TASK_LIST_LIMIT: usize = 200;

pub const DECOMPOSE_SYSTEM_PROMPT: &str = "\
You are a planning model that decomposes a software request into a \
hierarchical work breakdown structure.\n\
Output MUST be a single JSON or YAML document wrapped as:\n\
  type: decompose\n\
  version: 1\n\
  payload: { understanding, phases, potential_conflicts }\n\
Each phase has a name and ordered tasks; each task has id (temporary, \
response-local), title, description, acceptance_criteria, and dependencies \
referencing other task ids from this response.";

pub const PLAN_PATCH_SYSTEM_PROMPT: &str = "\
You are a planning model that edits an existing project plan.\n\
Output MUST be wrapped as type: plan_patch, version: 1, with payload \
{ operations }. Each operation is one of create, update, delete, move, and \
a sibling position carries exactly one of index, before, after.";

pub const PLAN_TASK_SYSTEM_PROMPT: &str = "\
You are a planning model that derives acceptance criteria from a PRD.\n\
Output MUST be wrapped as type: plan_task, version: 1, with payload \
{ task_id, acceptance_criteria }. Each criterion has id, description, \
type, and critical.";

pub const NEXT_ACTION_SYSTEM_PROMPT: &str = "\
You are a planning model orchestrating a coding task.\n\
Output MUST be wrapped as type: next_action, version: 1, with payload \
{ decision: { action, reason }, worker_call? }. The action is one of \
run_worker, mark_complete, ask_human, abort.";

pub const COMPLETION_SYSTEM_PROMPT: &str = "\
You are a planning model assessing whether a coding task satisfies its \
acceptance criteria.\n\
Output MUST be wrapped as type: completion_assessment, version: 1, with \
payload { all_criteria_satisfied, summary, by_criterion }.";

fn truncate(content: &str) -> String {
    if content.len() > HISTORY_CONTENT_LIMIT {
        let mut end = HISTORY_CONTENT_LIMIT;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &content[..end])
    } else {
        content.to_owned()
    }
}

/// User prompt for decompose: request plus workspace context.
pub fn build_decompose_user_prompt(req: &DecomposeRequest) -> String {
    let mut prompt = format!("User Input:\n{}\n\nContext:\n", req.user_input);
    prompt.push_str(&format!("Workspace: {}\n", req.context.workspace_path));

    if !req.context.existing_tasks.is_empty() {
        prompt.push_str("Existing Tasks:\n");
        for task in &req.context.existing_tasks {
            prompt.push_str(&format!("- {}: {} ({})\n", task.id, task.title, task.status));
        }
    }

    if let Some(overview) = &req.context.wbs_overview {
        prompt.push_str(&format!("\nWBS Overview:\n{overview}\n"));
    }

    if !req.context.conversation_history.is_empty() {
        prompt.push_str("\nConversation History:\n");
        for msg in &req.context.conversation_history {
            prompt.push_str(&format!("- [{}] {}\n", msg.role, truncate(&msg.content)));
        }
    }

    prompt
}

/// User prompt for plan-patch: includes the full WBS overview and bounded
/// task/history lists so the model can place operations precisely.
pub fn build_plan_patch_user_prompt(req: &PlanPatchRequest) -> String {
    let mut prompt = format!("User Input:\n{}\n\nContext:\n", req.user_input);

    if !req.context.existing_tasks.is_empty() {
        prompt.push_str("Existing Tasks:\n");
        let tasks = &req.context.existing_tasks;
        if tasks.len() > TASK_LIST_LIMIT {
            prompt.push_str(&format!(
                "(showing first {TASK_LIST_LIMIT} of {} tasks)\n",
                tasks.len()
            ));
        }
        for task in tasks.iter().take(TASK_LIST_LIMIT) {
            prompt.push_str(&format!("- {}: {} ({})\n", task.id, task.title, task.status));
        }
    }

    if let Some(overview) = &req.context.wbs_overview {
        prompt.push_str(&format!("\nWBS Structure:\n{overview}\n"));
    }

    let history = &req.context.conversation_history;
    if !history.is_empty() {
        prompt.push_str("\nConversation History:\n");
        let skip = history.len().saturating_sub(HISTORY_MESSAGE_LIMIT);
        for msg in history.iter().skip(skip) {
            prompt.push_str(&format!("- [{}] {}\n", msg.role, truncate(&msg.content)));
        }
    }

    prompt
}

/// User prompt for plan-task.
pub fn build_plan_task_user_prompt(prd_text: &str) -> String {
    format!("PRD:\n{prd_text}\n\nGenerate the plan.")
}

/// Compact task summary shared by next-action and completion prompts.
fn summarize(summary: &TaskSummary) -> String {
    let mut text = format!(
        "Task: {}\nState: {}\nAcceptance Criteria ({}):\n",
        summary.title,
        summary.state,
        summary.acceptance_criteria.len()
    );
    for ac in &summary.acceptance_criteria {
        let mark = if ac.passed { "x" } else { " " };
        text.push_str(&format!("- [{mark}] {}: {}\n", ac.id, ac.description));
    }
    text.push_str(&format!("Worker Runs: {}\n", summary.worker_runs_count));
    for run in &summary.worker_runs {
        text.push_str(&format!(
            "- {} (exit {}): {}\n",
            run.id,
            run.exit_code,
            truncate(&run.summary)
        ));
    }
    text
}

/// User prompt for next-action.
pub fn build_next_action_user_prompt(summary: &TaskSummary) -> String {
    format!("Context:\n{}\nDecide the next action.", summarize(summary))
}

/// User prompt for completion assessment.
pub fn build_completion_user_prompt(summary: &TaskSummary) -> String {
    format!(
        "Context:\n{}\nAssess whether every acceptance criterion is satisfied.",
        summarize(summary)
    )
}
