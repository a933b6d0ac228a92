//! `foreman plan` and `foreman patch`: planner round trips plus
//! application.

use anyhow::{Context, Result};

use foreman_core::events::EventBus;
use foreman_core::plan::{apply_decompose, apply_plan_patch, wbs_overview};
use foreman_core::planner::create_planner;
use foreman_core::planner::protocol::{
    DecomposeRequest, PlanPatchRequest, TaskFacet, WorkspaceContext,
};
use foreman_store::WorkspaceRepository;

use crate::config::ForemanConfig;

/// Assemble the workspace context shipped with planning requests.
fn workspace_context(repo: &WorkspaceRepository) -> Result<WorkspaceContext> {
    let tasks = repo.state().load_tasks()?;
    let existing_tasks = tasks
        .tasks
        .iter()
        .map(|task| TaskFacet {
            id: task.task_id.clone(),
            title: task.title.clone(),
            status: task.status.to_string(),
        })
        .collect();

    let wbs_overview = match repo.design().try_load_wbs()? {
        Some(wbs) => {
            let designs = repo.design().list_nodes()?;
            Some(wbs_overview(&wbs, &designs))
        }
        None => None,
    };

    Ok(WorkspaceContext {
        workspace_path: repo.dir().to_string_lossy().into_owned(),
        existing_tasks,
        wbs_overview,
        conversation_history: Vec::new(),
    })
}

pub async fn plan(repo: &WorkspaceRepository, config: &ForemanConfig, request: &str) -> Result<()> {
    let planner = create_planner(&config.planner)?;
    let response = planner
        .decompose(&DecomposeRequest {
            user_input: request.to_owned(),
            context: workspace_context(repo)?,
        })
        .await
        .context("decompose failed")?;

    if !response.understanding.is_empty() {
        println!("understanding: {}", response.understanding);
    }
    for conflict in &response.potential_conflicts {
        println!("potential conflict: {conflict}");
    }

    let tasks = apply_decompose(repo, &EventBus::new(), "default", &response)?;
    println!("created {} task(s):", tasks.len());
    for task in &tasks {
        println!("  {}  {}", task.task_id, task.title);
    }
    Ok(())
}

pub async fn patch(repo: &WorkspaceRepository, config: &ForemanConfig, request: &str) -> Result<()> {
    let planner = create_planner(&config.planner)?;
    let response = planner
        .plan_patch(&PlanPatchRequest {
            user_input: request.to_owned(),
            context: workspace_context(repo)?,
        })
        .await
        .context("plan_patch failed")?;

    let count = response.operations.len();
    apply_plan_patch(repo, &response)?;
    println!("applied {count} plan operation(s)");
    Ok(())
}
