//! The execution orchestrator: claims jobs and drives tasks to terminal
//! status.
//!
//! One long-lived actor per workspace with one worker loop per pool. Each
//! claimed job runs the control loop inside a fresh sandbox, then the
//! terminal status is reconciled back into state (task, node runtime, agent
//! slot) before the job is completed. Errors never bubble past this
//! boundary; every run ends in `succeeded` or `failed`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use foreman_store::models::{Action, Job, NodeStatus, Task, TaskStatus, action_kind};
use foreman_store::{FilesystemQueue, WorkspaceRepository};

use crate::control_loop::{ControlLoop, TaskRunOutcome};
use crate::events::EventBus;
use crate::planner::Planner;
use crate::worker::{Sandbox, WorkerConfig, WorkerExecutor};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Pools to serve; one worker loop each.
    pub pools: Vec<String>,
    /// Sleep between scans of an empty pool.
    pub idle_sleep: Duration,
    pub worker: WorkerConfig,
    /// Project repository the sandboxes bind to.
    pub project_root: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            pools: vec!["default".to_owned()],
            idle_sleep: Duration::from_millis(500),
            worker: WorkerConfig::default(),
            project_root: project_root.into(),
        }
    }
}

struct Inner {
    repo: WorkspaceRepository,
    queue: FilesystemQueue,
    planner: Arc<dyn Planner>,
    sandbox: Arc<dyn Sandbox>,
    events: EventBus,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    state_mutex: Arc<Mutex<()>>,
}

/// Long-lived execution actor for one workspace.
pub struct Orchestrator {
    inner: Arc<Inner>,
    handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: WorkspaceRepository,
        queue: FilesystemQueue,
        planner: Arc<dyn Planner>,
        sandbox: Arc<dyn Sandbox>,
        events: EventBus,
        config: OrchestratorConfig,
        cancel: CancellationToken,
        state_mutex: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                queue,
                planner,
                sandbox,
                events,
                config,
                cancel,
                state_mutex,
            }),
            handles: Vec::new(),
        }
    }

    /// Recover claimed jobs left by a previous process, then spawn the
    /// per-pool worker loops.
    pub async fn start(&mut self) -> Result<()> {
        for pool in self.inner.config.pools.clone() {
            let recovered = self
                .inner
                .queue
                .recover(&pool)
                .with_context(|| format!("failed to recover pool {pool}"))?;
            for job in recovered {
                info!(job_id = %job.id, pool_id = %pool, "re-claiming job left in processing");
                self.inner.handle_recovered_job(&job).await;
            }
        }

        for pool in self.inner.config.pools.clone() {
            let inner = Arc::clone(&self.inner);
            self.handles.push(tokio::spawn(async move {
                inner.pool_loop(pool).await;
            }));
        }
        Ok(())
    }

    /// Request termination of the worker loops.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Block until all worker loops have drained.
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Inner {
    async fn pool_loop(&self, pool_id: String) {
        info!(pool_id = %pool_id, "orchestrator pool loop started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.queue.dequeue(&pool_id) {
                Ok(Some(job)) => self.handle_job(&job).await,
                Ok(None) => self.idle().await,
                Err(e) => {
                    error!(pool_id = %pool_id, error = %e, "queue scan failed");
                    self.idle().await;
                }
            }
        }
        info!(pool_id = %pool_id, "orchestrator pool loop stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_sleep) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    /// Snapshot a task under the state lock.
    async fn load_task(&self, task_id: &str) -> Option<Task> {
        let _guard = self.state_mutex.lock().await;
        match self.repo.state().load_tasks() {
            Ok(tasks) => tasks.get(task_id).cloned(),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to load tasks");
                None
            }
        }
    }

    async fn handle_job(&self, job: &Job) {
        let Some(task) = self.load_task(&job.task_id).await else {
            warn!(job_id = %job.id, task_id = %job.task_id, "job references unknown task");
            self.complete(job);
            return;
        };

        match task.status {
            TaskStatus::Succeeded | TaskStatus::Failed => {
                // Already terminal (e.g. duplicate job); nothing to run.
                self.complete(job);
            }
            TaskStatus::Pending => {
                // A crash between enqueue and the state save left a stale
                // job; the scheduler will re-dispatch the task.
                warn!(job_id = %job.id, task_id = %task.task_id, "stale job for pending task");
                self.complete(job);
            }
            TaskStatus::Running => {
                let outcome = self.execute(&task).await;
                self.finalize(&task, &outcome).await;
                self.complete(job);
            }
        }
    }

    /// Recovery variant: a claimed job from a previous process. The task is
    /// failed with `crash-recovered` rather than resumed mid-machine.
    async fn handle_recovered_job(&self, job: &Job) {
        let Some(task) = self.load_task(&job.task_id).await else {
            self.complete(job);
            return;
        };
        if task.status == TaskStatus::Running {
            let outcome = TaskRunOutcome {
                attempt_id: String::new(),
                succeeded: false,
                error_summary: Some("crash-recovered".to_owned()),
                acceptance_criteria: task.acceptance_criteria.clone(),
                worker_runs: Vec::new(),
            };
            self.finalize(&task, &outcome).await;
        }
        self.complete(job);
    }

    /// Run the control loop for one task inside a fresh sandbox.
    async fn execute(&self, task: &Task) -> TaskRunOutcome {
        let mut executor = WorkerExecutor::new(
            self.config.worker.clone(),
            Arc::clone(&self.sandbox),
            self.config.project_root.clone(),
        );

        if let Err(e) = executor.start().await {
            return TaskRunOutcome {
                attempt_id: String::new(),
                succeeded: false,
                error_summary: Some(format!("sandbox start: {e}")),
                acceptance_criteria: task.acceptance_criteria.clone(),
                worker_runs: Vec::new(),
            };
        }

        let control_loop = ControlLoop::new(
            Arc::clone(&self.planner),
            self.repo.clone(),
            self.events.clone(),
            self.cancel.child_token(),
        );
        let outcome = control_loop.run(task, &executor).await;

        if let Err(e) = executor.stop().await {
            warn!(task_id = %task.task_id, error = %e, "sandbox teardown failed");
        }
        outcome
    }

    /// Write the terminal status back into state, release the agent slot,
    /// and record the terminal action (state first, history last).
    async fn finalize(&self, task: &Task, outcome: &TaskRunOutcome) {
        let _guard = self.state_mutex.lock().await;
        let now = Utc::now();
        let to = if outcome.succeeded {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        };

        let result: Result<()> = async {
            let mut tasks = self.repo.state().load_tasks()?;
            let Some(stored) = tasks.get_mut(&task.task_id) else {
                warn!(task_id = %task.task_id, "task vanished before finalize");
                return Ok(());
            };
            let from = stored.status;
            stored.status = to;
            stored.updated_at = now;
            stored.done_at = Some(now);
            stored.attempt_count += 1;
            stored.acceptance_criteria = outcome.acceptance_criteria.clone();

            let mut nodes = self.repo.state().load_nodes_runtime()?;
            let node_status = if outcome.succeeded {
                NodeStatus::Implemented
            } else {
                NodeStatus::Failed
            };
            nodes.set_status(&task.node_id, node_status, now);

            let mut agents = self.repo.state().load_agents()?;
            agents.release_task(&task.task_id);

            // Terminal records: state before history, so replay never sees
            // a terminal action for a task still marked running.
            self.repo.state().save_tasks(&tasks)?;
            self.repo.state().save_nodes_runtime(&nodes)?;
            self.repo.state().save_agents(&agents)?;

            let kind = if outcome.succeeded {
                action_kind::TASK_SUCCEEDED
            } else {
                action_kind::TASK_FAILED
            };
            let mut payload = serde_json::Map::new();
            payload.insert("task_id".into(), serde_json::json!(task.task_id));
            if !outcome.attempt_id.is_empty() {
                payload.insert("attempt_id".into(), serde_json::json!(outcome.attempt_id));
            }
            if let Some(summary) = &outcome.error_summary {
                payload.insert("error".into(), serde_json::json!(summary));
            }
            self.repo
                .history()
                .append_action(&Action::new(kind, self.repo.workspace_id(), payload))?;

            self.events.status_changed(&task.task_id, from, to);
            info!(task_id = %task.task_id, status = %to, "task finalized");
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(task_id = %task.task_id, error = %e, "failed to finalize task");
        }
    }

    fn complete(&self, job: &Job) {
        if let Err(e) = self.queue.complete(&job.id, &job.pool_id) {
            error!(job_id = %job.id, error = %e, "failed to complete job");
        }
    }
}
