//! The task input document handed to the agent binary over stdin.

use serde::{Deserialize, Serialize};

use foreman_store::models::Task;

/// Root of the task input YAML (`version: "1"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub version: String,
    pub task: TaskSection,
    pub runner: RunnerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSection {
    pub id: String,
    pub title: String,
    pub repo: String,
    pub prd: PrdSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrdSection {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSection {
    pub max_loops: u32,
    pub worker: WorkerSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSection {
    pub cli: String,
}

/// Compose the PRD text for a task: title, description, goal input, and
/// acceptance criteria.
pub fn prd_text(task: &Task) -> String {
    let mut text = format!("Execute task: {}\n", task.title);
    if !task.description.is_empty() {
        text.push_str(&format!("\n{}\n", task.description));
    }
    if let Some(goal) = task.inputs.get("goal").and_then(|v| v.as_str()) {
        if goal != task.description {
            text.push_str(&format!("\nGoal:\n{goal}\n"));
        }
    }
    if !task.acceptance_criteria.is_empty() {
        text.push_str("\nAcceptance Criteria:\n");
        for ac in &task.acceptance_criteria {
            text.push_str(&format!("- {}\n", ac.description));
        }
    }
    text
}

impl TaskInput {
    /// Build the input document for a task and worker CLI.
    pub fn from_task(task: &Task, cli: &str) -> Self {
        Self {
            version: "1".to_owned(),
            task: TaskSection {
                id: task.task_id.clone(),
                title: task.title.clone(),
                repo: ".".to_owned(),
                prd: PrdSection {
                    text: prd_text(task),
                },
            },
            runner: RunnerSection {
                max_loops: task.max_loops(),
                worker: WorkerSection {
                    cli: cli.to_owned(),
                },
            },
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}
