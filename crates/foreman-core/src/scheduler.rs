//! The task scheduler: dependency resolution and agent dispatch.
//!
//! `check_and_schedule` is the sole mutating entry. It loads the state
//! collections, filters pending tasks whose dependencies are satisfied,
//! assigns agents by capability and capacity, enqueues one job per
//! dispatched task, and persists history first, then tasks, then agents.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use foreman_store::models::{Action, Job, TaskStatus, Wbs, action_kind};
use foreman_store::{FilesystemQueue, WorkspaceRepository};

use crate::events::EventBus;

/// One dispatch performed during a scheduling pass.
#[derive(Debug, Clone)]
struct Dispatch {
    task_id: String,
    agent_id: String,
    job: Job,
}

/// Serial scheduler over one workspace's state.
pub struct Scheduler {
    repo: WorkspaceRepository,
    queue: FilesystemQueue,
    events: EventBus,
    /// In-process single-writer guard shared with the orchestrator.
    state_mutex: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(
        repo: WorkspaceRepository,
        queue: FilesystemQueue,
        events: EventBus,
        state_mutex: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            repo,
            queue,
            events,
            state_mutex,
        }
    }

    /// One scheduling pass. Returns the number of tasks dispatched.
    pub async fn check_and_schedule(&self) -> Result<usize> {
        let _guard = self.state_mutex.lock().await;

        let mut tasks = self.repo.state().load_tasks().context("failed to load tasks")?;
        let nodes_runtime = self
            .repo
            .state()
            .load_nodes_runtime()
            .context("failed to load nodes runtime")?;
        let mut agents = self
            .repo
            .state()
            .load_agents()
            .context("failed to load agents")?;
        let wbs = self.repo.design().try_load_wbs()?;

        // Candidates: pending tasks whose node dependencies are satisfied.
        let mut candidates: Vec<(usize, String)> = tasks
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                task.dependencies
                    .iter()
                    .all(|dep| nodes_runtime.is_satisfied(dep))
            })
            .map(|task| (depth_of(wbs.as_ref(), &task.node_id), task.task_id.clone()))
            .collect();

        if candidates.is_empty() {
            return Ok(0);
        }

        // Scheduling order: WBS depth, then creation time, then task ID.
        candidates.sort_by(|a, b| {
            let task_a = tasks.get(&a.1).expect("candidate exists");
            let task_b = tasks.get(&b.1).expect("candidate exists");
            a.0.cmp(&b.0)
                .then(task_a.created_at.cmp(&task_b.created_at))
                .then(a.1.cmp(&b.1))
        });

        let mut dispatches: Vec<Dispatch> = Vec::new();
        for (_, task_id) in candidates {
            let task = tasks.get(&task_id).expect("candidate exists");
            let Some(agent) = agents
                .agents
                .iter_mut()
                .find(|agent| agent.kind == task.kind && agent.has_capacity())
            else {
                debug!(task_id = %task_id, kind = %task.kind, "no agent with capacity");
                continue;
            };

            let agent_id = agent.agent_id.clone();
            agent.running_tasks.push(task_id.clone());

            let now = Utc::now();
            let task = tasks.get_mut(&task_id).expect("candidate exists");
            task.status = TaskStatus::Running;
            task.assigned_agent = Some(agent_id.clone());
            task.updated_at = now;
            task.started_at = Some(now);

            let job = Job::run_task(
                &task.task_id,
                &task.pool_id,
                now.timestamp_nanos_opt().unwrap_or_default(),
            );
            self.queue
                .enqueue(&job)
                .with_context(|| format!("failed to enqueue job for task {task_id}"))?;

            info!(task_id = %task_id, agent_id = %agent_id, job_id = %job.id, "task dispatched");
            dispatches.push(Dispatch {
                task_id,
                agent_id,
                job,
            });
        }

        if dispatches.is_empty() {
            return Ok(0);
        }

        // Persistence order: history first, then tasks, then agents, so a
        // crash can only lose state that replay re-derives conservatively.
        for dispatch in &dispatches {
            let mut payload = serde_json::Map::new();
            payload.insert("task_id".into(), serde_json::json!(dispatch.task_id));
            payload.insert("agent_id".into(), serde_json::json!(dispatch.agent_id));
            payload.insert("job_id".into(), serde_json::json!(dispatch.job.id));
            self.repo
                .history()
                .append_action(&Action::new(
                    action_kind::TASK_STARTED,
                    self.repo.workspace_id(),
                    payload,
                ))
                .context("failed to append task.started")?;
        }
        self.repo
            .state()
            .save_tasks(&tasks)
            .context("failed to save tasks")?;
        self.repo
            .state()
            .save_agents(&agents)
            .context("failed to save agents")?;

        for dispatch in &dispatches {
            self.events
                .status_changed(&dispatch.task_id, TaskStatus::Pending, TaskStatus::Running);
        }

        Ok(dispatches.len())
    }

    /// Manual (re)scheduling entry: a pending task is left for the next
    /// pass; a failed task is reset to pending. Anything else is not
    /// schedulable.
    pub async fn schedule_task(&self, task_id: &str) -> Result<()> {
        let _guard = self.state_mutex.lock().await;

        let mut tasks = self.repo.state().load_tasks().context("failed to load tasks")?;
        let task = tasks
            .get_mut(task_id)
            .with_context(|| format!("task {task_id} not found"))?;

        match task.status {
            TaskStatus::Pending => Ok(()),
            TaskStatus::Failed => {
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
                task.updated_at = Utc::now();
                task.done_at = None;
                let from = TaskStatus::Failed;
                let task_id = task.task_id.clone();
                self.repo
                    .state()
                    .save_tasks(&tasks)
                    .context("failed to save tasks")?;
                self.events.status_changed(&task_id, from, TaskStatus::Pending);
                Ok(())
            }
            status => bail!("task {task_id} is not in a schedulable state: {status}"),
        }
    }
}

fn depth_of(wbs: Option<&Wbs>, node_id: &str) -> usize {
    wbs.map(|wbs| wbs.depth(node_id)).unwrap_or(0)
}
