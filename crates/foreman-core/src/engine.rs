//! The workspace engine: one scheduler plus one orchestrator behind the
//! workspace lock.
//!
//! The scheduler re-ticks on every progress event and on a periodic timer;
//! the orchestrator serves the pools concurrently. The engine owns the
//! advisory workspace lock for its whole lifetime, making the pair the
//! single writer over `state/`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use foreman_store::repo::WorkspaceLock;
use foreman_store::{FilesystemQueue, WorkspaceRepository};

use crate::events::EventBus;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::planner::Planner;
use crate::scheduler::Scheduler;
use crate::worker::Sandbox;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Periodic scheduler tick.
    pub tick_interval: Duration,
    pub orchestrator: OrchestratorConfig,
}

impl EngineConfig {
    pub fn new(orchestrator: OrchestratorConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            orchestrator,
        }
    }
}

/// Scheduler + orchestrator pair for one workspace.
pub struct Engine {
    // Held for the engine's lifetime; a second engine on the same
    // workspace fails at construction.
    _lock: WorkspaceLock,
    repo: WorkspaceRepository,
    queue: FilesystemQueue,
    scheduler: Scheduler,
    orchestrator: Orchestrator,
    events: EventBus,
    cancel: CancellationToken,
    tick_interval: Duration,
    pools: Vec<String>,
}

impl Engine {
    pub fn new(
        repo: WorkspaceRepository,
        queue: FilesystemQueue,
        planner: Arc<dyn Planner>,
        sandbox: Arc<dyn Sandbox>,
        events: EventBus,
        config: EngineConfig,
    ) -> Result<Self> {
        let lock = repo.lock().context("workspace is in use by another engine")?;
        let cancel = CancellationToken::new();
        let state_mutex = Arc::new(Mutex::new(()));
        let pools = config.orchestrator.pools.clone();

        let scheduler = Scheduler::new(
            repo.clone(),
            queue.clone(),
            events.clone(),
            Arc::clone(&state_mutex),
        );
        let orchestrator = Orchestrator::new(
            repo.clone(),
            queue.clone(),
            planner,
            sandbox,
            events.clone(),
            config.orchestrator,
            cancel.clone(),
            state_mutex,
        );

        Ok(Self {
            _lock: lock,
            repo,
            queue,
            scheduler,
            orchestrator,
            events,
            cancel,
            tick_interval: config.tick_interval,
            pools,
        })
    }

    /// Token that stops the engine when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled.
    pub async fn run(&mut self) -> Result<()> {
        self.run_inner(false).await
    }

    /// Run until every task is terminal and the queues are drained (or the
    /// engine is cancelled). Used by one-shot CLI runs and tests.
    pub async fn run_until_drained(&mut self) -> Result<()> {
        self.run_inner(true).await
    }

    async fn run_inner(&mut self, drain: bool) -> Result<()> {
        self.orchestrator.start().await?;
        let mut progress = self.events.subscribe();
        info!("engine started");

        while !self.cancel.is_cancelled() {
            // A failed pass is logged; the next tick retries.
            if let Err(e) = self.scheduler.check_and_schedule().await {
                error!(error = %e, "scheduler pass failed");
            }

            if drain && self.drained()? {
                break;
            }

            // Re-tick on progress events or on the timer, whichever first.
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = progress.recv() => {}
                _ = self.cancel.cancelled() => {}
            }
        }

        self.orchestrator.stop();
        self.orchestrator.wait().await;
        info!("engine stopped");
        Ok(())
    }

    /// All tasks terminal and nothing queued or claimed.
    fn drained(&self) -> Result<bool> {
        let tasks = self.repo.state().load_tasks()?;
        let all_terminal = tasks.tasks.iter().all(|t| t.status.is_terminal());
        if !all_terminal {
            return Ok(false);
        }
        for pool in &self.pools {
            if !self.queue.list_jobs(pool)?.is_empty() || !self.queue.recover(pool)?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
