//! Shared fixtures for foreman integration tests: temp workspaces, state
//! seeding helpers, and fake agent CLI scripts.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::TempDir;

use foreman_store::models::{Agent, AgentsState, Task, TasksState};
use foreman_store::{FilesystemQueue, WorkspaceRepository};

/// A workspace rooted in a temp directory, deleted on drop.
pub struct TempWorkspace {
    pub dir: TempDir,
    pub repo: WorkspaceRepository,
    pub queue: FilesystemQueue,
}

impl TempWorkspace {
    /// Create and initialize a workspace with a fixed test fingerprint.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp workspace");
        let repo = WorkspaceRepository::new(dir.path(), "feedfacecafe");
        repo.init().expect("failed to init workspace repository");
        let queue = FilesystemQueue::new(dir.path());
        Self { dir, repo, queue }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Add an agent slot to the persisted agents state.
    pub fn seed_agent(&self, agent_id: &str, kind: &str, max_parallel: usize) {
        let mut agents = self.repo.state().load_agents().expect("load agents");
        agents.agents.push(Agent {
            agent_id: agent_id.to_owned(),
            kind: kind.to_owned(),
            max_parallel,
            running_tasks: Vec::new(),
        });
        self.repo
            .state()
            .save_agents(&agents)
            .expect("save agents");
    }

    /// Add a pending task with the given node dependencies.
    pub fn seed_task(&self, task_id: &str, node_id: &str, dependencies: &[&str]) -> Task {
        let mut task = Task::new(task_id, node_id, task_id, "default", Utc::now());
        task.dependencies = dependencies.iter().map(|s| s.to_string()).collect();
        let mut tasks = self.repo.state().load_tasks().expect("load tasks");
        tasks.tasks.push(task.clone());
        self.repo.state().save_tasks(&tasks).expect("save tasks");
        task
    }

    /// Replace the persisted agents state.
    pub fn save_agents(&self, agents: AgentsState) {
        self.repo.state().save_agents(&agents).expect("save agents");
    }

    /// Replace the persisted tasks state.
    pub fn save_tasks(&self, tasks: TasksState) {
        self.repo.state().save_tasks(&tasks).expect("save tasks");
    }
}

impl Default for TempWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Write an executable shell script that stands in for an agent CLI.
/// Returns its absolute path.
pub fn write_fake_cli(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake cli");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake cli");
    }
    path
}
