//! Scripted planner for tests and dry runs.
//!
//! Responses are queued per operation; when a queue runs dry the mock falls
//! back to a benign default (mark complete / all criteria satisfied), so a
//! happy-path run needs no scripting at all.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::error::PlannerError;
use super::protocol::{
    CompletionAssessmentResponse, Decision, DecomposeRequest, DecomposeResponse, NextActionKind,
    NextActionResponse, PlanPatchRequest, PlanPatchResponse, PlanTaskResponse, TaskSummary,
    WorkerCall,
};
use super::Planner;

type Scripted<T> = Mutex<VecDeque<Result<T, PlannerError>>>;

/// Planner backend with scripted responses.
#[derive(Default)]
pub struct MockPlanner {
    decompose: Scripted<DecomposeResponse>,
    plan_patch: Scripted<PlanPatchResponse>,
    plan_task: Scripted<PlanTaskResponse>,
    next_action: Scripted<NextActionResponse>,
    assessment: Scripted<CompletionAssessmentResponse>,
    /// Operation names in call order, for assertions.
    calls: Mutex<Vec<String>>,
}

impl MockPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_decompose(&self, response: DecomposeResponse) {
        self.decompose.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_plan_patch(&self, response: PlanPatchResponse) {
        self.plan_patch.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_plan_task(&self, response: PlanTaskResponse) {
        self.plan_task.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_plan_task_error(&self, error: PlannerError) {
        self.plan_task.lock().unwrap().push_back(Err(error));
    }

    pub fn push_next_action(&self, response: NextActionResponse) {
        self.next_action.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a `run_worker` decision with the given prompt.
    pub fn push_run_worker(&self, prompt: &str) {
        self.push_next_action(NextActionResponse {
            decision: Decision {
                action: NextActionKind::RunWorker,
                reason: "scripted worker run".to_owned(),
            },
            worker_call: Some(WorkerCall {
                prompt: prompt.to_owned(),
                ..Default::default()
            }),
        });
    }

    /// Queue a bare decision with no worker call.
    pub fn push_decision(&self, action: NextActionKind) {
        self.push_next_action(NextActionResponse {
            decision: Decision {
                action,
                reason: "scripted decision".to_owned(),
            },
            worker_call: None,
        });
    }

    pub fn push_assessment(&self, response: CompletionAssessmentResponse) {
        self.assessment.lock().unwrap().push_back(Ok(response));
    }

    /// Queue an assessment verdict with no per-criterion detail.
    pub fn push_verdict(&self, all_criteria_satisfied: bool) {
        self.push_assessment(CompletionAssessmentResponse {
            all_criteria_satisfied,
            summary: "scripted assessment".to_owned(),
            by_criterion: Vec::new(),
        });
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str) {
        self.calls.lock().unwrap().push(op.to_owned());
    }

    fn pop<T>(&self, queue: &Scripted<T>) -> Option<Result<T, PlannerError>> {
        queue.lock().unwrap().pop_front()
    }
}

#[async_trait::async_trait]
impl Planner for MockPlanner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn test_connection(&self) -> Result<(), PlannerError> {
        Ok(())
    }

    async fn decompose(&self, _req: &DecomposeRequest) -> Result<DecomposeResponse, PlannerError> {
        self.record("decompose");
        self.pop(&self.decompose).unwrap_or_else(|| {
            Ok(DecomposeResponse {
                understanding: String::new(),
                phases: Vec::new(),
                potential_conflicts: Vec::new(),
            })
        })
    }

    async fn plan_patch(
        &self,
        _req: &PlanPatchRequest,
    ) -> Result<PlanPatchResponse, PlannerError> {
        self.record("plan_patch");
        self.pop(&self.plan_patch)
            .unwrap_or_else(|| Ok(PlanPatchResponse { operations: Vec::new() }))
    }

    async fn plan_task(&self, _prd_text: &str) -> Result<PlanTaskResponse, PlannerError> {
        self.record("plan_task");
        self.pop(&self.plan_task).unwrap_or_else(|| {
            Ok(PlanTaskResponse {
                task_id: String::new(),
                acceptance_criteria: Vec::new(),
            })
        })
    }

    async fn next_action(
        &self,
        _summary: &TaskSummary,
    ) -> Result<NextActionResponse, PlannerError> {
        self.record("next_action");
        self.pop(&self.next_action).unwrap_or_else(|| {
            Ok(NextActionResponse {
                decision: Decision {
                    action: NextActionKind::MarkComplete,
                    reason: "default: nothing scripted".to_owned(),
                },
                worker_call: None,
            })
        })
    }

    async fn completion_assessment(
        &self,
        _summary: &TaskSummary,
    ) -> Result<CompletionAssessmentResponse, PlannerError> {
        self.record("completion_assessment");
        self.pop(&self.assessment).unwrap_or_else(|| {
            Ok(CompletionAssessmentResponse {
                all_criteria_satisfied: true,
                summary: "default: satisfied".to_owned(),
                by_criterion: Vec::new(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_are_consumed_in_order() {
        let mock = MockPlanner::new();
        mock.push_run_worker("first run");
        mock.push_decision(NextActionKind::MarkComplete);

        let summary = TaskSummary {
            title: "t".into(),
            state: "running".into(),
            acceptance_criteria: vec![],
            worker_runs_count: 0,
            worker_runs: vec![],
        };

        let first = mock.next_action(&summary).await.unwrap();
        assert_eq!(first.decision.action, NextActionKind::RunWorker);
        assert_eq!(first.worker_call.unwrap().prompt, "first run");

        let second = mock.next_action(&summary).await.unwrap();
        assert_eq!(second.decision.action, NextActionKind::MarkComplete);

        // Queue exhausted: default decision.
        let third = mock.next_action(&summary).await.unwrap();
        assert_eq!(third.decision.action, NextActionKind::MarkComplete);

        assert_eq!(mock.calls(), vec!["next_action"; 3]);
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let mock = MockPlanner::new();
        mock.push_plan_task_error(PlannerError::MalformedPayload("bad".into()));
        let err = mock.plan_task("prd").await.unwrap_err();
        assert!(matches!(err, PlannerError::MalformedPayload(_)));
    }
}
