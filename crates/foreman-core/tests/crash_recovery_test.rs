//! S6: jobs left in `processing/` by a crashed process are re-claimed at
//! startup and their tasks settle without duplicate terminal records.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use foreman_core::events::EventBus;
use foreman_core::orchestrator::{Orchestrator, OrchestratorConfig};
use foreman_core::planner::MockPlanner;
use foreman_core::worker::LocalSandbox;
use foreman_store::models::{Action, Job, TaskStatus, action_kind};
use foreman_test_utils::TempWorkspace;

/// Simulate the crashed process: task dispatched (running, agent bound,
/// `task.started` durable) and its job already claimed into `processing/`.
fn seed_crashed_run(ws: &TempWorkspace) {
    ws.seed_agent("a1", "default", 1);
    ws.seed_task("t1", "n1", &[]);

    let mut tasks = ws.repo.state().load_tasks().unwrap();
    let task = tasks.get_mut("t1").unwrap();
    task.status = TaskStatus::Running;
    task.assigned_agent = Some("a1".to_owned());
    task.started_at = Some(Utc::now());
    ws.repo.state().save_tasks(&tasks).unwrap();

    let mut agents = ws.repo.state().load_agents().unwrap();
    agents.get_mut("a1").unwrap().running_tasks.push("t1".to_owned());
    ws.repo.state().save_agents(&agents).unwrap();

    let mut payload = serde_json::Map::new();
    payload.insert("task_id".into(), serde_json::json!("t1"));
    payload.insert("agent_id".into(), serde_json::json!("a1"));
    ws.repo
        .history()
        .append_action(&Action::new(
            action_kind::TASK_STARTED,
            ws.repo.workspace_id(),
            payload,
        ))
        .unwrap();

    // Enqueue and claim, as the dead orchestrator would have.
    ws.queue.enqueue(&Job::run_task("t1", "default", 1)).unwrap();
    let claimed = ws.queue.dequeue("default").unwrap().unwrap();
    assert_eq!(claimed.task_id, "t1");
}

async fn orchestrator_for(ws: &TempWorkspace) -> Orchestrator {
    let mut config = OrchestratorConfig::new(ws.path());
    config.idle_sleep = Duration::from_millis(20);
    Orchestrator::new(
        ws.repo.clone(),
        ws.queue.clone(),
        Arc::new(MockPlanner::new()),
        Arc::new(LocalSandbox::new()),
        EventBus::new(),
        config,
        CancellationToken::new(),
        Arc::new(Mutex::new(())),
    )
}

#[tokio::test]
async fn recovered_running_task_fails_with_crash_recovered() {
    let ws = TempWorkspace::new();
    seed_crashed_run(&ws);

    let mut orchestrator = orchestrator_for(&ws).await;
    orchestrator.start().await.unwrap();
    orchestrator.stop();
    orchestrator.wait().await;

    // The orphaned task is failed with the crash marker.
    let tasks = ws.repo.state().load_tasks().unwrap();
    let task = tasks.get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    // Agent slot reconciled, claimed job gone.
    let agents = ws.repo.state().load_agents().unwrap();
    assert!(agents.agents[0].running_tasks.is_empty());
    assert!(ws.queue.recover("default").unwrap().is_empty());

    // History: one started, one failed (crash-recovered), zero succeeded.
    let now = Utc::now();
    let actions = ws
        .repo
        .history()
        .list_actions(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
        .unwrap();
    let failed: Vec<_> = actions
        .iter()
        .filter(|a| a.kind == action_kind::TASK_FAILED)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].payload.get("error").and_then(|v| v.as_str()),
        Some("crash-recovered")
    );
    assert!(
        !actions.iter().any(|a| a.kind == action_kind::TASK_SUCCEEDED),
        "no duplicate success may appear"
    );
}

#[tokio::test]
async fn recovered_job_for_terminal_task_is_dropped() {
    let ws = TempWorkspace::new();
    ws.seed_agent("a1", "default", 1);
    ws.seed_task("t1", "n1", &[]);

    // Terminal task, but its claimed job survived the crash.
    let mut tasks = ws.repo.state().load_tasks().unwrap();
    tasks.get_mut("t1").unwrap().status = TaskStatus::Succeeded;
    ws.repo.state().save_tasks(&tasks).unwrap();
    ws.queue.enqueue(&Job::run_task("t1", "default", 1)).unwrap();
    ws.queue.dequeue("default").unwrap().unwrap();

    let mut orchestrator = orchestrator_for(&ws).await;
    orchestrator.start().await.unwrap();
    orchestrator.stop();
    orchestrator.wait().await;

    // Dropped without effect: still succeeded, no new terminal actions.
    let tasks = ws.repo.state().load_tasks().unwrap();
    assert_eq!(tasks.get("t1").unwrap().status, TaskStatus::Succeeded);
    assert!(ws.queue.recover("default").unwrap().is_empty());

    let now = Utc::now();
    let actions = ws
        .repo
        .history()
        .list_actions(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
        .unwrap();
    assert!(actions.is_empty());
}

#[tokio::test]
async fn recovered_job_for_pending_task_leaves_it_for_the_scheduler() {
    let ws = TempWorkspace::new();
    ws.seed_agent("a1", "default", 1);
    ws.seed_task("t1", "n1", &[]);

    // Crash happened between enqueue and the tasks save: job claimed but
    // the task is still pending.
    ws.queue.enqueue(&Job::run_task("t1", "default", 1)).unwrap();
    ws.queue.dequeue("default").unwrap().unwrap();

    let mut orchestrator = orchestrator_for(&ws).await;
    orchestrator.start().await.unwrap();
    orchestrator.stop();
    orchestrator.wait().await;

    let tasks = ws.repo.state().load_tasks().unwrap();
    assert_eq!(tasks.get("t1").unwrap().status, TaskStatus::Pending);
    assert!(ws.queue.recover("default").unwrap().is_empty());
}
