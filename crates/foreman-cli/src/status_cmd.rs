//! `foreman status` and `foreman log`: read-only workspace views.

use anyhow::Result;
use chrono::{Duration, Utc};

use foreman_store::WorkspaceRepository;

pub fn status(repo: &WorkspaceRepository) -> Result<()> {
    let tasks = repo.state().load_tasks()?;
    let agents = repo.state().load_agents()?;
    let runtime = repo.state().load_nodes_runtime()?;

    if tasks.tasks.is_empty() {
        println!("no tasks (run `foreman plan` first)");
    } else {
        println!("{:<40} {:<10} {:<10} {}", "TASK", "STATUS", "AGENT", "TITLE");
        for task in &tasks.tasks {
            println!(
                "{:<40} {:<10} {:<10} {}",
                task.task_id,
                task.status.to_string(),
                task.assigned_agent.as_deref().unwrap_or("-"),
                task.title
            );
        }
    }

    if !agents.agents.is_empty() {
        println!();
        println!("{:<12} {:<12} {}", "AGENT", "KIND", "RUNNING");
        for agent in &agents.agents {
            println!(
                "{:<12} {:<12} {}/{}",
                agent.agent_id,
                agent.kind,
                agent.running_tasks.len(),
                agent.max_parallel
            );
        }
    }

    if !runtime.nodes.is_empty() {
        println!();
        println!("{:<40} {}", "NODE", "STATUS");
        for node in &runtime.nodes {
            println!("{:<40} {}", node.node_id, node.status);
        }
    }
    Ok(())
}

pub fn log(repo: &WorkspaceRepository, task_id: &str) -> Result<()> {
    let attempts = repo.attempts().load_attempts(task_id)?;
    if attempts.is_empty() {
        println!("no attempts recorded for {task_id}");
    } else {
        println!("attempts:");
        for attempt in &attempts {
            let finished = attempt
                .finished_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_owned());
            let error = attempt.error_summary.as_deref().unwrap_or("");
            println!(
                "  {}  {}  {} .. {}  {}",
                attempt.attempt_id,
                attempt.status,
                attempt.started_at.to_rfc3339(),
                finished,
                error
            );
        }
    }

    // Last 30 days of history for this task.
    let now = Utc::now();
    let actions = repo.history().list_actions(now - Duration::days(30), now)?;
    let mine: Vec<_> = actions
        .iter()
        .filter(|a| a.payload.get("task_id").and_then(|v| v.as_str()) == Some(task_id))
        .collect();
    if !mine.is_empty() {
        println!("history:");
        for action in mine {
            println!("  {}  {}", action.at.to_rfc3339(), action.kind);
        }
    }
    Ok(())
}
