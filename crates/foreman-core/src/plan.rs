//! Plan application: turning planner output into persisted design + state.
//!
//! Decompose responses become WBS subtrees (root -> phase -> task nodes)
//! with pending tasks and node runtimes; plan-patch responses edit the
//! existing tree in place. Both validate the resulting dependency graph is
//! acyclic before anything is persisted.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use foreman_store::models::{
    Action, NodeDesign, NodeStatus, Task, Wbs, WbsNodeEntry, action_kind,
};
use foreman_store::{StoreError, WorkspaceRepository};

use crate::events::{EventBus, ProgressEvent};
use crate::planner::protocol::{
    DecomposeResponse, PatchOpKind, PlanPatchResponse, SiblingPosition,
};

/// Errors from applying planner output to the workspace.
#[derive(Debug, Error)]
pub enum PlanApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {task:?} depends on unknown node or temp-id {dependency:?}")]
    DanglingDependency { task: String, dependency: String },

    #[error("dependency cycle detected involving nodes: {0}")]
    CycleDetected(String),

    #[error("patch operation references unknown node {0:?}")]
    UnknownNode(String),

    #[error("patch operation references unknown parent {0:?}")]
    UnknownParent(String),
}

fn new_node_id() -> String {
    format!("node-{}", Uuid::new_v4())
}

fn new_task_id() -> String {
    format!("task-{}", Uuid::new_v4())
}

/// One-line-per-node rendering of the WBS for planner prompts.
pub fn wbs_overview(wbs: &Wbs, designs: &[NodeDesign]) -> String {
    let names: HashMap<&str, &str> = designs
        .iter()
        .map(|d| (d.node_id.as_str(), d.name.as_str()))
        .collect();

    let mut out = String::new();
    let mut stack: Vec<(String, usize)> = vec![(wbs.root_node_id.clone(), 0)];
    while let Some((node_id, depth)) = stack.pop() {
        let name = names.get(node_id.as_str()).copied().unwrap_or("");
        out.push_str(&format!("{}{node_id}: {name}\n", "  ".repeat(depth)));
        if let Some(entry) = wbs.node_index.get(&node_id) {
            for child in entry.children.iter().rev() {
                stack.push((child.clone(), depth + 1));
            }
        }
    }
    out
}

/// Apply a decompose response: extend the WBS, create node designs, pending
/// tasks, and node runtimes, and record `plan.applied`.
///
/// Dependencies may reference temp-IDs from the same response or existing
/// node IDs; anything else is an error and nothing is persisted.
pub fn apply_decompose(
    repo: &WorkspaceRepository,
    events: &EventBus,
    pool_id: &str,
    response: &DecomposeResponse,
) -> Result<Vec<Task>, PlanApplyError> {
    let mut wbs = match repo.design().try_load_wbs()? {
        Some(wbs) => wbs,
        None => Wbs::new(format!("wbs-{}", Uuid::new_v4()), "root"),
    };
    let existing_designs = repo.design().list_nodes()?;
    let existing_ids: HashSet<String> =
        existing_designs.iter().map(|d| d.node_id.clone()).collect();

    // First pass: create phase and task nodes, recording the temp-ID map.
    let root_id = wbs.root_node_id.clone();
    let mut temp_to_node: HashMap<String, String> = HashMap::new();
    let mut new_designs: Vec<NodeDesign> = Vec::new();
    let mut planned: Vec<(String, &crate::planner::protocol::PlannedTask)> = Vec::new();

    for phase in &response.phases {
        let phase_id = new_node_id();
        wbs.push_child(&root_id, phase_id.clone());
        new_designs.push(NodeDesign {
            node_id: phase_id.clone(),
            name: phase.name.clone(),
            dependencies: Vec::new(),
            acceptance_criteria: Vec::new(),
            level: 1,
        });

        for task in &phase.tasks {
            let node_id = new_node_id();
            wbs.push_child(&phase_id, node_id.clone());
            temp_to_node.insert(task.temp_id.clone(), node_id.clone());
            planned.push((node_id, task));
        }
    }

    // Second pass: resolve dependencies (temp-IDs first, then existing
    // node IDs) and build the node designs.
    for (node_id, task) in &planned {
        let mut dependencies = Vec::new();
        for dep in &task.dependencies {
            let resolved = temp_to_node
                .get(dep)
                .cloned()
                .or_else(|| existing_ids.contains(dep).then(|| dep.clone()))
                .ok_or_else(|| PlanApplyError::DanglingDependency {
                    task: task.title.clone(),
                    dependency: dep.clone(),
                })?;
            dependencies.push(resolved);
        }
        new_designs.push(NodeDesign {
            node_id: node_id.clone(),
            name: task.title.clone(),
            dependencies,
            acceptance_criteria: task.acceptance_criteria.clone(),
            level: 2,
        });
    }

    check_acyclic(existing_designs.iter().chain(new_designs.iter()))?;

    // Build the executable tasks.
    let now = Utc::now();
    let mut new_tasks: Vec<Task> = Vec::new();
    for (node_id, planned_task) in &planned {
        let design = new_designs
            .iter()
            .find(|d| &d.node_id == node_id)
            .expect("design created above");
        let mut task = Task::new(
            new_task_id(),
            node_id.clone(),
            planned_task.title.as_str(),
            pool_id,
            now,
        );
        task.description = planned_task.description.clone();
        task.dependencies = design.dependencies.clone();
        if !planned_task.description.is_empty() {
            task.inputs
                .insert("goal".into(), serde_json::json!(planned_task.description));
        }
        new_tasks.push(task);
    }

    // Persist design, then state, then the applied marker.
    repo.design().save_wbs(&wbs)?;
    for design in &new_designs {
        repo.design().save_node(design)?;
    }

    let mut tasks = repo.state().load_tasks()?;
    tasks.tasks.extend(new_tasks.iter().cloned());
    repo.state().save_tasks(&tasks)?;

    let mut runtime = repo.state().load_nodes_runtime()?;
    for design in &new_designs {
        if runtime.get(&design.node_id).is_none() {
            runtime.set_status(&design.node_id, NodeStatus::Pending, now);
        }
    }
    repo.state().save_nodes_runtime(&runtime)?;

    let mut payload = serde_json::Map::new();
    payload.insert("phase_count".into(), serde_json::json!(response.phases.len()));
    payload.insert("task_count".into(), serde_json::json!(new_tasks.len()));
    repo.history().append_action(&Action::new(
        action_kind::PLAN_APPLIED,
        repo.workspace_id(),
        payload,
    ))?;

    for task in &new_tasks {
        events.emit(ProgressEvent::TaskCreated { task: task.clone() });
    }
    info!(
        phases = response.phases.len(),
        tasks = new_tasks.len(),
        "decomposition applied"
    );
    Ok(new_tasks)
}

/// Apply a plan patch: ordered create/update/delete/move operations over
/// the existing WBS.
pub fn apply_plan_patch(
    repo: &WorkspaceRepository,
    response: &PlanPatchResponse,
) -> Result<(), PlanApplyError> {
    let mut wbs = repo.design().load_wbs()?;
    let mut designs: HashMap<String, NodeDesign> = repo
        .design()
        .list_nodes()?
        .into_iter()
        .map(|d| (d.node_id.clone(), d))
        .collect();
    let mut deleted: HashSet<String> = HashSet::new();
    let now = Utc::now();

    for op in &response.operations {
        match op.op {
            PatchOpKind::Create => {
                let parent_id = op
                    .parent_id
                    .clone()
                    .unwrap_or_else(|| wbs.root_node_id.clone());
                if !wbs.node_index.contains_key(&parent_id) {
                    return Err(PlanApplyError::UnknownParent(parent_id));
                }
                let node_id = if op.node_id.is_empty() {
                    new_node_id()
                } else {
                    op.node_id.clone()
                };
                wbs.node_index.insert(
                    node_id.clone(),
                    WbsNodeEntry {
                        parent_id: Some(parent_id.clone()),
                        children: Vec::new(),
                    },
                );
                let parent = wbs.node_index.get_mut(&parent_id).expect("checked above");
                place(&mut parent.children, &node_id, op.position.as_ref());

                let parent_level = designs.get(&parent_id).map(|d| d.level).unwrap_or(0);
                designs.insert(
                    node_id.clone(),
                    NodeDesign {
                        node_id: node_id.clone(),
                        name: op.title.clone().unwrap_or_else(|| node_id.clone()),
                        dependencies: op.dependencies.clone().unwrap_or_default(),
                        acceptance_criteria: Vec::new(),
                        level: parent_level + 1,
                    },
                );
                deleted.remove(&node_id);
            }

            PatchOpKind::Update => {
                let design = designs
                    .get_mut(&op.node_id)
                    .ok_or_else(|| PlanApplyError::UnknownNode(op.node_id.clone()))?;
                if let Some(title) = &op.title {
                    design.name = title.clone();
                }
                if let Some(dependencies) = &op.dependencies {
                    design.dependencies = dependencies.clone();
                }
                // Descriptions live on tasks, and tasks denormalize their
                // node's dependency edges; keep both in sync.
                if op.description.is_some() || op.dependencies.is_some() {
                    let mut tasks = repo.state().load_tasks()?;
                    let mut changed = false;
                    for task in tasks.tasks.iter_mut().filter(|t| t.node_id == op.node_id) {
                        if let Some(description) = &op.description {
                            task.description = description.clone();
                        }
                        if let Some(dependencies) = &op.dependencies {
                            task.dependencies = dependencies.clone();
                        }
                        task.updated_at = now;
                        changed = true;
                    }
                    if changed {
                        repo.state().save_tasks(&tasks)?;
                    }
                }
            }

            PatchOpKind::Delete => {
                if !wbs.node_index.contains_key(&op.node_id) {
                    return Err(PlanApplyError::UnknownNode(op.node_id.clone()));
                }
                // Delete cascades to descendants.
                let mut doomed = wbs.descendants(&op.node_id);
                doomed.push(op.node_id.clone());
                if let Some(parent_id) = wbs
                    .node_index
                    .get(&op.node_id)
                    .and_then(|e| e.parent_id.clone())
                {
                    if let Some(parent) = wbs.node_index.get_mut(&parent_id) {
                        parent.children.retain(|c| c != &op.node_id);
                    }
                }
                for node_id in doomed {
                    wbs.node_index.remove(&node_id);
                    designs.remove(&node_id);
                    deleted.insert(node_id);
                }
            }

            PatchOpKind::Move => {
                let entry = wbs
                    .node_index
                    .get(&op.node_id)
                    .cloned()
                    .ok_or_else(|| PlanApplyError::UnknownNode(op.node_id.clone()))?;
                let old_parent = entry.parent_id.clone();
                let new_parent = op
                    .parent_id
                    .clone()
                    .or(old_parent.clone())
                    .ok_or_else(|| PlanApplyError::UnknownNode(op.node_id.clone()))?;
                if !wbs.node_index.contains_key(&new_parent) {
                    return Err(PlanApplyError::UnknownParent(new_parent));
                }

                if let Some(old_parent) = &old_parent {
                    if let Some(parent) = wbs.node_index.get_mut(old_parent) {
                        parent.children.retain(|c| c != &op.node_id);
                    }
                }
                if let Some(entry) = wbs.node_index.get_mut(&op.node_id) {
                    entry.parent_id = Some(new_parent.clone());
                }
                let parent = wbs
                    .node_index
                    .get_mut(&new_parent)
                    .expect("checked above");
                place(&mut parent.children, &op.node_id, op.position.as_ref());
            }
        }
    }

    check_acyclic(designs.values())?;

    repo.design().save_wbs(&wbs)?;
    for design in designs.values() {
        repo.design().save_node(design)?;
    }
    let mut runtime = repo.state().load_nodes_runtime()?;
    for node_id in &deleted {
        repo.design().delete_node(node_id)?;
        runtime.nodes.retain(|n| &n.node_id != node_id);
    }
    for design in designs.values() {
        if runtime.get(&design.node_id).is_none() {
            runtime.set_status(&design.node_id, NodeStatus::Pending, now);
        }
    }
    repo.state().save_nodes_runtime(&runtime)?;

    let mut payload = serde_json::Map::new();
    payload.insert(
        "operation_count".into(),
        serde_json::json!(response.operations.len()),
    );
    repo.history().append_action(&Action::new(
        action_kind::PLAN_PATCHED,
        repo.workspace_id(),
        payload,
    ))?;

    info!(operations = response.operations.len(), "plan patch applied");
    Ok(())
}

/// Insert `node_id` among `children` at the requested sibling position.
fn place(children: &mut Vec<String>, node_id: &str, position: Option<&SiblingPosition>) {
    children.retain(|c| c != node_id);
    let index = match position {
        None => children.len(),
        Some(SiblingPosition::Index { index }) => (*index).min(children.len()),
        Some(SiblingPosition::Before { before }) => children
            .iter()
            .position(|c| c == before)
            .unwrap_or(children.len()),
        Some(SiblingPosition::After { after }) => children
            .iter()
            .position(|c| c == after)
            .map(|i| i + 1)
            .unwrap_or(children.len()),
    };
    children.insert(index, node_id.to_owned());
}

/// Kahn's algorithm over the node dependency edges; errors on a cycle.
fn check_acyclic<'a>(
    designs: impl Iterator<Item = &'a NodeDesign>,
) -> Result<(), PlanApplyError> {
    let designs: Vec<&NodeDesign> = designs.collect();
    let index_of: HashMap<&str, usize> = designs
        .iter()
        .enumerate()
        .map(|(i, d)| (d.node_id.as_str(), i))
        .collect();

    let n = designs.len();
    let mut in_degree = vec![0usize; n];
    let mut adjacent: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, design) in designs.iter().enumerate() {
        for dep in &design.dependencies {
            // Edges to nodes outside the design set cannot form a cycle.
            if let Some(&dep_idx) = index_of.get(dep.as_str()) {
                adjacent[dep_idx].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adjacent[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted != n {
        let cycle: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| designs[i].node_id.as_str())
            .collect();
        return Err(PlanApplyError::CycleDetected(cycle.join(", ")));
    }
    Ok(())
}
