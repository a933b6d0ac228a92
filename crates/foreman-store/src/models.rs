use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Runtime status of a WBS node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    InProgress,
    Implemented,
    Verified,
    Failed,
}

impl NodeStatus {
    /// A dependency on this node is satisfied once the node is implemented
    /// or verified.
    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Implemented | Self::Verified)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Implemented => "implemented",
            Self::Verified => "verified",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeStatus {
    type Err = NodeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "implemented" => Ok(Self::Implemented),
            "verified" => Ok(Self::Verified),
            "failed" => Ok(Self::Failed),
            other => Err(NodeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeStatusParseError(pub String);

impl fmt::Display for NodeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node status: {:?}", self.0)
    }
}

impl std::error::Error for NodeStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Acceptance criteria
// ---------------------------------------------------------------------------

/// One acceptance criterion attached to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub description: String,
    /// Criterion kind (e.g. "functional", "test").
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub critical: bool,
    /// Latest assessment result, carried in task summaries.
    #[serde(default)]
    pub passed: bool,
}

// ---------------------------------------------------------------------------
// WBS
// ---------------------------------------------------------------------------

/// One entry in the WBS node index: tree position of a single node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WbsNodeEntry {
    /// Absent for the root node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Ordered children; sibling order is the only definition of position.
    #[serde(default)]
    pub children: Vec<String>,
}

/// The Work Breakdown Structure: a rooted ordered tree over node IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wbs {
    pub wbs_id: String,
    pub root_node_id: String,
    /// node_id -> tree entry. BTreeMap keeps serialization deterministic.
    pub node_index: std::collections::BTreeMap<String, WbsNodeEntry>,
}

impl Wbs {
    /// Create a WBS containing only a root node.
    pub fn new(wbs_id: impl Into<String>, root_node_id: impl Into<String>) -> Self {
        let root = root_node_id.into();
        let mut node_index = std::collections::BTreeMap::new();
        node_index.insert(root.clone(), WbsNodeEntry::default());
        Self {
            wbs_id: wbs_id.into(),
            root_node_id: root,
            node_index,
        }
    }

    /// Attach `node_id` as the last child of `parent_id`.
    pub fn push_child(&mut self, parent_id: &str, node_id: impl Into<String>) {
        let node_id = node_id.into();
        self.node_index.insert(
            node_id.clone(),
            WbsNodeEntry {
                parent_id: Some(parent_id.to_owned()),
                children: Vec::new(),
            },
        );
        if let Some(parent) = self.node_index.get_mut(parent_id) {
            parent.children.push(node_id);
        }
    }

    /// Depth of a node below the root (root is 0). Unknown nodes report the
    /// maximum depth so they sort last in scheduling order.
    pub fn depth(&self, node_id: &str) -> usize {
        let mut depth = 0usize;
        let mut current = node_id;
        while let Some(entry) = self.node_index.get(current) {
            match entry.parent_id.as_deref() {
                Some(parent) => {
                    depth += 1;
                    current = parent;
                }
                None => return depth,
            }
            // Malformed index guard: a parent chain longer than the index
            // itself means a cycle.
            if depth > self.node_index.len() {
                break;
            }
        }
        usize::MAX
    }

    /// All descendants of `node_id` (not including the node itself), in
    /// depth-first sibling order.
    pub fn descendants(&self, node_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<String> = self
            .node_index
            .get(node_id)
            .map(|e| e.children.iter().rev().cloned().collect())
            .unwrap_or_default();
        while let Some(id) = stack.pop() {
            if let Some(entry) = self.node_index.get(&id) {
                stack.extend(entry.children.iter().rev().cloned());
            }
            out.push(id);
        }
        out
    }
}

/// Static design data for one WBS node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDesign {
    pub node_id: String,
    pub name: String,
    /// DAG edges to other nodes, orthogonal to the tree.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Abstraction level: 0 is conceptual, larger is more concrete.
    #[serde(default)]
    pub level: u32,
}

/// Runtime status of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRuntime {
    pub node_id: String,
    pub status: NodeStatus,
    pub updated_at: DateTime<Utc>,
}

/// The persisted collection of node runtimes (`state/nodes_runtime.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesRuntime {
    #[serde(default)]
    pub nodes: Vec<NodeRuntime>,
}

impl NodesRuntime {
    pub fn get(&self, node_id: &str) -> Option<&NodeRuntime> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Set a node's status, inserting the record if it is not yet tracked.
    pub fn set_status(&mut self, node_id: &str, status: NodeStatus, now: DateTime<Utc>) {
        match self.nodes.iter_mut().find(|n| n.node_id == node_id) {
            Some(node) => {
                node.status = status;
                node.updated_at = now;
            }
            None => self.nodes.push(NodeRuntime {
                node_id: node_id.to_owned(),
                status,
                updated_at: now,
            }),
        }
    }

    /// A dependency is satisfied iff its node is tracked and implemented or
    /// verified. Untracked nodes are unsatisfied (fail safe).
    pub fn is_satisfied(&self, node_id: &str) -> bool {
        self.get(node_id).is_some_and(|n| n.status.is_satisfied())
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// The executable instance bound to a WBS node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub node_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    /// Node IDs this task depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub pool_id: String,
    /// Required agent capability.
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
    /// Free-form runner inputs (e.g. `max_loops`, `goal`).
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
}

fn default_kind() -> String {
    "default".to_owned()
}

impl Task {
    /// Create a pending task bound to a node.
    pub fn new(
        task_id: impl Into<String>,
        node_id: impl Into<String>,
        title: impl Into<String>,
        pool_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            node_id: node_id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            dependencies: Vec::new(),
            pool_id: pool_id.into(),
            kind: default_kind(),
            assigned_agent: None,
            status: TaskStatus::Pending,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            done_at: None,
            inputs: serde_json::Map::new(),
        }
    }

    /// The control-loop iteration budget, from `inputs.max_loops`
    /// (default 5).
    pub fn max_loops(&self) -> u32 {
        self.inputs
            .get("max_loops")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(5)
    }
}

/// The persisted collection of tasks (`state/tasks.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasksState {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TasksState {
    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }
}

/// One execution of a task. Immutable after its terminal record is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt_id: String,
    pub task_id: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// A worker slot with bounded parallelism. Not a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    /// Capability tag matched against [`Task::kind`].
    pub kind: String,
    pub max_parallel: usize,
    #[serde(default)]
    pub running_tasks: Vec<String>,
}

impl Agent {
    pub fn has_capacity(&self) -> bool {
        self.running_tasks.len() < self.max_parallel
    }
}

/// The persisted collection of agents (`state/agents.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentsState {
    #[serde(default)]
    pub agents: Vec<Agent>,
}

impl AgentsState {
    pub fn get_mut(&mut self, agent_id: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.agent_id == agent_id)
    }

    /// Remove a task from whichever agent is running it.
    pub fn release_task(&mut self, task_id: &str) {
        for agent in &mut self.agents {
            agent.running_tasks.retain(|t| t != task_id);
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A queued work item. Exists only while queued or claimed.
///
/// Serialized with camelCase keys per the job file wire schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "poolId")]
    pub pool_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl Job {
    /// Build a run-task job. The ID embeds the enqueue time in nanoseconds
    /// so lexicographic file ordering tracks enqueue order per task.
    pub fn run_task(task_id: &str, pool_id: &str, unix_nanos: i64) -> Self {
        Self {
            id: format!("{task_id}-{unix_nanos}"),
            task_id: task_id.to_owned(),
            pool_id: pool_id.to_owned(),
            payload: serde_json::json!({ "action": "run_task" }),
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Action kinds written by the engine.
pub mod action_kind {
    pub const PLAN_APPLIED: &str = "plan.applied";
    pub const PLAN_PATCHED: &str = "plan.patched";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_ATTEMPT_STARTED: &str = "task.attempt_started";
    pub const TASK_PLAN: &str = "task.plan";
    pub const TASK_DECISION: &str = "task.decision";
    pub const TASK_WORKER_RUN: &str = "task.worker_run";
    pub const TASK_ASSESSMENT: &str = "task.assessment";
    pub const TASK_SUCCEEDED: &str = "task.succeeded";
    pub const TASK_FAILED: &str = "task.failed";
}

/// An append-only history record. Never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub at: DateTime<Utc>,
    pub kind: String,
    pub workspace_id: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, Value>,
}

impl Action {
    /// Create an action stamped now with a fresh UUID.
    pub fn new(
        kind: &str,
        workspace_id: &str,
        payload: serde_json::Map<String, Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            at: Utc::now(),
            kind: kind.to_owned(),
            workspace_id: workspace_id.to_owned(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("ready".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn node_status_satisfaction() {
        assert!(NodeStatus::Implemented.is_satisfied());
        assert!(NodeStatus::Verified.is_satisfied());
        assert!(!NodeStatus::Pending.is_satisfied());
        assert!(!NodeStatus::InProgress.is_satisfied());
        assert!(!NodeStatus::Failed.is_satisfied());
    }

    #[test]
    fn nodes_runtime_untracked_is_unsatisfied() {
        let runtime = NodesRuntime::default();
        assert!(!runtime.is_satisfied("n1"));
    }

    #[test]
    fn nodes_runtime_set_status_inserts_then_updates() {
        let mut runtime = NodesRuntime::default();
        let now = Utc::now();
        runtime.set_status("n1", NodeStatus::InProgress, now);
        assert_eq!(runtime.nodes.len(), 1);
        runtime.set_status("n1", NodeStatus::Implemented, now);
        assert_eq!(runtime.nodes.len(), 1);
        assert!(runtime.is_satisfied("n1"));
    }

    #[test]
    fn wbs_depth_counts_edges_to_root() {
        let mut wbs = Wbs::new("wbs-1", "root");
        wbs.push_child("root", "phase-1");
        wbs.push_child("phase-1", "n1");
        assert_eq!(wbs.depth("root"), 0);
        assert_eq!(wbs.depth("phase-1"), 1);
        assert_eq!(wbs.depth("n1"), 2);
        assert_eq!(wbs.depth("missing"), usize::MAX);
    }

    #[test]
    fn wbs_descendants_in_sibling_order() {
        let mut wbs = Wbs::new("wbs-1", "root");
        wbs.push_child("root", "a");
        wbs.push_child("root", "b");
        wbs.push_child("a", "a1");
        assert_eq!(wbs.descendants("root"), vec!["a", "a1", "b"]);
    }

    #[test]
    fn task_max_loops_reads_inputs_with_default() {
        let mut task = Task::new("t1", "n1", "demo", "default", Utc::now());
        assert_eq!(task.max_loops(), 5);
        task.inputs
            .insert("max_loops".into(), serde_json::json!(2));
        assert_eq!(task.max_loops(), 2);
    }

    #[test]
    fn agent_capacity() {
        let mut agent = Agent {
            agent_id: "a1".into(),
            kind: "default".into(),
            max_parallel: 1,
            running_tasks: vec![],
        };
        assert!(agent.has_capacity());
        agent.running_tasks.push("t1".into());
        assert!(!agent.has_capacity());
    }

    #[test]
    fn job_serializes_camel_case_keys() {
        let job = Job::run_task("t1", "default", 42);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["taskId"], "t1");
        assert_eq!(value["poolId"], "default");
        assert_eq!(value["id"], "t1-42");
        assert_eq!(value["payload"]["action"], "run_task");
    }

    #[test]
    fn agents_state_release_task() {
        let mut agents = AgentsState {
            agents: vec![Agent {
                agent_id: "a1".into(),
                kind: "default".into(),
                max_parallel: 2,
                running_tasks: vec!["t1".into(), "t2".into()],
            }],
        };
        agents.release_task("t1");
        assert_eq!(agents.agents[0].running_tasks, vec!["t2".to_string()]);
    }
}
