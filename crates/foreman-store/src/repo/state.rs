//! State sub-repository: tasks, agents, and node runtimes.
//!
//! Each save replaces the entire collection atomically. Collections are
//! workspace-scale, so whole-file read-modify-write keeps the concurrency
//! story simple: the workspace lock makes the scheduler/orchestrator pair
//! the single writer.

use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::fsutil;
use crate::models::{AgentsState, NodesRuntime, TasksState};

/// Accessor for `state/` within a workspace.
#[derive(Debug)]
pub struct StateStore<'a> {
    dir: &'a Path,
}

impl<'a> StateStore<'a> {
    pub(super) fn new(dir: &'a Path) -> Self {
        Self { dir }
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join("state").join(file)
    }

    pub fn save_tasks(&self, tasks: &TasksState) -> Result<(), StoreError> {
        fsutil::atomic_write_json(&self.path("tasks.json"), tasks, "tasks state")
    }

    /// Load all tasks; an unwritten state file is an empty collection.
    pub fn load_tasks(&self) -> Result<TasksState, StoreError> {
        Ok(fsutil::read_json(&self.path("tasks.json"))?.unwrap_or_default())
    }

    pub fn save_agents(&self, agents: &AgentsState) -> Result<(), StoreError> {
        fsutil::atomic_write_json(&self.path("agents.json"), agents, "agents state")
    }

    pub fn load_agents(&self) -> Result<AgentsState, StoreError> {
        Ok(fsutil::read_json(&self.path("agents.json"))?.unwrap_or_default())
    }

    pub fn save_nodes_runtime(&self, nodes: &NodesRuntime) -> Result<(), StoreError> {
        fsutil::atomic_write_json(&self.path("nodes_runtime.json"), nodes, "nodes runtime")
    }

    pub fn load_nodes_runtime(&self) -> Result<NodesRuntime, StoreError> {
        Ok(fsutil::read_json(&self.path("nodes_runtime.json"))?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::super::WorkspaceRepository;
    use crate::models::{Agent, AgentsState, NodeStatus, NodesRuntime, Task, TasksState};
    use chrono::Utc;

    fn repo() -> (tempfile::TempDir, WorkspaceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = WorkspaceRepository::new(dir.path(), "abc123def456");
        repo.init().unwrap();
        (dir, repo)
    }

    #[test]
    fn unwritten_state_loads_as_empty_collections() {
        let (_dir, repo) = repo();
        assert!(repo.state().load_tasks().unwrap().tasks.is_empty());
        assert!(repo.state().load_agents().unwrap().agents.is_empty());
        assert!(repo.state().load_nodes_runtime().unwrap().nodes.is_empty());
    }

    #[test]
    fn tasks_round_trip_structurally_equal() {
        let (_dir, repo) = repo();
        let mut task = Task::new("t1", "n1", "demo task", "default", Utc::now());
        task.dependencies.push("n0".to_owned());
        task.inputs
            .insert("max_loops".to_owned(), serde_json::json!(3));
        let state = TasksState { tasks: vec![task] };

        repo.state().save_tasks(&state).unwrap();
        assert_eq!(repo.state().load_tasks().unwrap(), state);
    }

    #[test]
    fn agents_round_trip() {
        let (_dir, repo) = repo();
        let state = AgentsState {
            agents: vec![Agent {
                agent_id: "a1".into(),
                kind: "default".into(),
                max_parallel: 2,
                running_tasks: vec!["t1".into()],
            }],
        };
        repo.state().save_agents(&state).unwrap();
        assert_eq!(repo.state().load_agents().unwrap(), state);
    }

    #[test]
    fn nodes_runtime_round_trips() {
        let (_dir, repo) = repo();
        let mut nodes = NodesRuntime::default();
        nodes.set_status("n1", NodeStatus::Implemented, Utc::now());
        repo.state().save_nodes_runtime(&nodes).unwrap();
        assert_eq!(repo.state().load_nodes_runtime().unwrap(), nodes);
    }

    #[test]
    fn save_replaces_the_whole_collection() {
        let (_dir, repo) = repo();
        let now = Utc::now();
        repo.state()
            .save_tasks(&TasksState {
                tasks: vec![Task::new("t1", "n1", "one", "default", now)],
            })
            .unwrap();
        repo.state()
            .save_tasks(&TasksState {
                tasks: vec![Task::new("t2", "n2", "two", "default", now)],
            })
            .unwrap();

        let loaded = repo.state().load_tasks().unwrap();
        assert_eq!(loaded.tasks.len(), 1);
        assert_eq!(loaded.tasks[0].task_id, "t2");
    }
}
