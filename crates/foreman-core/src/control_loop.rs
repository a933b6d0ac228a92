//! The per-task control loop: an explicit Meta→Worker state machine.
//!
//! ```text
//! START -> PLANNING -> DECIDING -> (RUNNING_WORKER -> DECIDING)* -> ASSESSING -> COMPLETE | FAILED
//! ```
//!
//! Each transition is persisted as an action before advancing, so a crashed
//! run can be reconstructed from history. Worker runs are bounded by the
//! task's `max_loops`; cancellation is checked at every transition.

use std::fmt;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foreman_store::WorkspaceRepository;
use foreman_store::models::{
    AcceptanceCriterion, Action, Attempt, AttemptStatus, Task, action_kind,
};

use crate::events::EventBus;
use crate::planner::protocol::{NextActionKind, TaskSummary, WorkerCall, WorkerRunSummary};
use crate::planner::{Planner, PlannerError};
use crate::worker::{WorkerExecutor, WorkerRunResult};

/// States of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Planning,
    Deciding,
    RunningWorker,
    Assessing,
    Complete,
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Deciding => "deciding",
            Self::RunningWorker => "running_worker",
            Self::Assessing => "assessing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one control-loop run.
#[derive(Debug)]
pub struct TaskRunOutcome {
    pub attempt_id: String,
    pub succeeded: bool,
    pub error_summary: Option<String>,
    /// Criteria as updated by planning and assessment.
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    pub worker_runs: Vec<WorkerRunResult>,
}

/// Drives one task to a terminal status.
pub struct ControlLoop {
    planner: std::sync::Arc<dyn Planner>,
    repo: WorkspaceRepository,
    events: EventBus,
    cancel: CancellationToken,
}

impl ControlLoop {
    pub fn new(
        planner: std::sync::Arc<dyn Planner>,
        repo: WorkspaceRepository,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            planner,
            repo,
            events,
            cancel,
        }
    }

    /// Run the state machine for `task` using a started worker executor.
    /// Always returns a terminal outcome; errors become failures.
    pub async fn run(&self, task: &Task, executor: &WorkerExecutor) -> TaskRunOutcome {
        let attempt_id = uuid::Uuid::new_v4().to_string();
        let mut attempt = Attempt {
            attempt_id: attempt_id.clone(),
            task_id: task.task_id.clone(),
            status: AttemptStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            error_summary: None,
        };

        // The "attempt started" record is durable before any side effect.
        let started = self
            .record(
                action_kind::TASK_ATTEMPT_STARTED,
                serde_json::json!({ "task_id": task.task_id, "attempt_id": attempt_id }),
            )
            .and_then(|()| {
                self.repo
                    .attempts()
                    .append_attempt(&attempt)
                    .map_err(|e| format!("attempt log write failed: {e}"))
            });

        let mut criteria = task.acceptance_criteria.clone();
        let mut runs: Vec<WorkerRunResult> = Vec::new();

        let result = match started {
            Ok(()) => self.drive(task, executor, &mut criteria, &mut runs).await,
            Err(e) => Err(e),
        };

        attempt.finished_at = Some(Utc::now());
        let outcome = match result {
            Ok(()) => {
                attempt.status = AttemptStatus::Succeeded;
                info!(task_id = %task.task_id, attempt_id = %attempt_id, "control loop completed");
                TaskRunOutcome {
                    attempt_id,
                    succeeded: true,
                    error_summary: None,
                    acceptance_criteria: criteria,
                    worker_runs: runs,
                }
            }
            Err(reason) => {
                attempt.status = AttemptStatus::Failed;
                attempt.error_summary = Some(reason.clone());
                warn!(task_id = %task.task_id, attempt_id = %attempt_id, reason = %reason, "control loop failed");
                TaskRunOutcome {
                    attempt_id,
                    succeeded: false,
                    error_summary: Some(reason),
                    acceptance_criteria: criteria,
                    worker_runs: runs,
                }
            }
        };

        if let Err(e) = self.repo.attempts().append_attempt(&attempt) {
            warn!(task_id = %task.task_id, error = %e, "failed to finalize attempt record");
        }
        outcome
    }

    /// The state machine proper. `Err` carries the failure summary.
    async fn drive(
        &self,
        task: &Task,
        executor: &WorkerExecutor,
        criteria: &mut Vec<AcceptanceCriterion>,
        runs: &mut Vec<WorkerRunResult>,
    ) -> Result<(), String> {
        let max_loops = task.max_loops();
        // Guard against Deciding<->Assessing cycles that never run a
        // worker; the machine must terminate even then.
        let iteration_budget = 2 * max_loops + 4;
        let mut iterations = 0u32;
        let mut pending_call: Option<WorkerCall> = None;
        let mut state = LoopState::Planning;

        loop {
            self.check_cancel()?;
            self.events
                .progress(&task.task_id, &state.to_string(), None);

            match state {
                LoopState::Planning => {
                    let plan = self
                        .planner
                        .plan_task(&crate::taskfile::prd_text(task))
                        .await
                        .map_err(describe_planner_error)?;
                    if !plan.acceptance_criteria.is_empty() {
                        *criteria = plan.acceptance_criteria;
                    }
                    self.record(
                        action_kind::TASK_PLAN,
                        serde_json::json!({
                            "task_id": task.task_id,
                            "criteria_count": criteria.len(),
                        }),
                    )?;
                    state = LoopState::Deciding;
                }

                LoopState::Deciding => {
                    iterations += 1;
                    if iterations > iteration_budget {
                        return Err("max_loops exceeded".to_owned());
                    }

                    let summary = self.summarize(task, criteria, runs);
                    let next = self
                        .planner
                        .next_action(&summary)
                        .await
                        .map_err(describe_planner_error)?;
                    self.record(
                        action_kind::TASK_DECISION,
                        serde_json::json!({
                            "task_id": task.task_id,
                            "action": next.decision.action.to_string(),
                            "reason": next.decision.reason,
                        }),
                    )?;

                    match next.decision.action {
                        NextActionKind::RunWorker => {
                            let Some(call) = next.worker_call else {
                                return Err(
                                    "planner decided run_worker without a worker_call".to_owned()
                                );
                            };
                            pending_call = Some(call);
                            state = LoopState::RunningWorker;
                        }
                        NextActionKind::MarkComplete => state = LoopState::Assessing,
                        NextActionKind::AskHuman => {
                            return Err(format!(
                                "awaiting human input: {}",
                                next.decision.reason
                            ));
                        }
                        NextActionKind::Abort => {
                            return Err(format!("aborted by planner: {}", next.decision.reason));
                        }
                    }
                }

                LoopState::RunningWorker => {
                    if runs.len() as u32 + 1 > max_loops {
                        return Err("max_loops exceeded".to_owned());
                    }
                    let call = pending_call
                        .take()
                        .expect("entered RunningWorker without a worker call");

                    let result = executor
                        .run_worker(&call)
                        .await
                        .map_err(|e| format!("worker executor: {e}"))?;
                    self.record(
                        action_kind::TASK_WORKER_RUN,
                        serde_json::json!({
                            "task_id": task.task_id,
                            "run_id": result.id,
                            "exit_code": result.exit_code,
                        }),
                    )?;

                    if let Some(fault) = &result.error {
                        return Err(format!("sandbox fault: {fault}"));
                    }
                    runs.push(result);
                    state = LoopState::Deciding;
                }

                LoopState::Assessing => {
                    let summary = self.summarize(task, criteria, runs);
                    let assessment = self
                        .planner
                        .completion_assessment(&summary)
                        .await
                        .map_err(describe_planner_error)?;

                    for result in &assessment.by_criterion {
                        if let Some(ac) = criteria.iter_mut().find(|ac| ac.id == result.id) {
                            ac.passed = result.status == "passed";
                        }
                    }
                    self.record(
                        action_kind::TASK_ASSESSMENT,
                        serde_json::json!({
                            "task_id": task.task_id,
                            "all_criteria_satisfied": assessment.all_criteria_satisfied,
                            "summary": assessment.summary,
                        }),
                    )?;

                    if assessment.all_criteria_satisfied {
                        state = LoopState::Complete;
                    } else {
                        // Gaps remain; another worker run may fix them.
                        state = LoopState::Deciding;
                    }
                }

                LoopState::Complete => return Ok(()),
                LoopState::Failed => unreachable!("failures return early"),
            }
        }
    }

    fn check_cancel(&self) -> Result<(), String> {
        if self.cancel.is_cancelled() {
            Err("canceled".to_owned())
        } else {
            Ok(())
        }
    }

    fn summarize(
        &self,
        task: &Task,
        criteria: &[AcceptanceCriterion],
        runs: &[WorkerRunResult],
    ) -> TaskSummary {
        TaskSummary {
            title: task.title.clone(),
            state: "running".to_owned(),
            acceptance_criteria: criteria.to_vec(),
            worker_runs_count: runs.len(),
            worker_runs: runs
                .iter()
                .map(|run| WorkerRunSummary {
                    id: run.id.clone(),
                    exit_code: run.exit_code,
                    summary: run.summary.clone(),
                })
                .collect(),
        }
    }

    fn record(&self, kind: &str, payload: serde_json::Value) -> Result<(), String> {
        let payload = match payload {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        self.repo
            .history()
            .append_action(&Action::new(kind, self.repo.workspace_id(), payload))
            .map_err(|e| format!("history write failed: {e}"))
    }
}

fn describe_planner_error(err: PlannerError) -> String {
    format!("planning model: {err}")
}
