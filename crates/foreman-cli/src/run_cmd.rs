//! `foreman run` and `foreman schedule`: the engine entrypoints.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;

use foreman_core::engine::{Engine, EngineConfig};
use foreman_core::events::{EventBus, NotesSink};
use foreman_core::orchestrator::OrchestratorConfig;
use foreman_core::planner::create_planner;
use foreman_core::scheduler::Scheduler;
use foreman_core::worker::create_sandbox;
use foreman_store::{FilesystemQueue, WorkspaceRepository};

use crate::config::ForemanConfig;

pub async fn run(
    repo: WorkspaceRepository,
    queue: FilesystemQueue,
    config: &ForemanConfig,
    project_root: PathBuf,
    pools: Vec<String>,
    drain: bool,
) -> Result<()> {
    let planner = create_planner(&config.planner)?;
    let sandbox = create_sandbox(&config.sandbox_mode, config.docker_image.as_deref())?;

    let mut orchestrator_config = OrchestratorConfig::new(project_root);
    orchestrator_config.pools = pools;
    orchestrator_config.worker = config.worker.clone();

    let events = EventBus::with_notes(NotesSink::new(repo.dir()));
    let mut engine = Engine::new(
        repo,
        queue,
        planner,
        sandbox,
        events,
        EngineConfig::new(orchestrator_config),
    )?;

    // Ctrl-C stops the engine; in-flight tasks fail with "canceled".
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    if drain {
        engine.run_until_drained().await
    } else {
        engine.run().await
    }
}

pub async fn schedule(
    repo: &WorkspaceRepository,
    queue: &FilesystemQueue,
    task_id: &str,
) -> Result<()> {
    let scheduler = Scheduler::new(
        repo.clone(),
        queue.clone(),
        EventBus::new(),
        Arc::new(Mutex::new(())),
    );
    scheduler.schedule_task(task_id).await?;
    println!("task {task_id} is schedulable; it will dispatch on the next engine tick");
    Ok(())
}
