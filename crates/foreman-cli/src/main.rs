mod agent_cmd;
mod config;
mod plan_cmd;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use foreman_store::{FilesystemQueue, WorkspaceRepository, WorkspaceStore};

use config::ForemanConfig;

#[derive(Parser)]
#[command(name = "foreman", about = "Workspace-local orchestrator for LLM coding-agent tasks")]
struct Cli {
    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Workspace base directory (overrides config)
    #[arg(long, global = true)]
    workspace_dir: Option<PathBuf>,

    /// Planner backend (overrides config)
    #[arg(long, global = true)]
    planner: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or refresh) the workspace for a project root
    Init,
    /// Decompose a request into a plan and persist it
    Plan {
        /// The free-form request to decompose
        request: String,
    },
    /// Ask the planner for plan edits and apply them
    Patch {
        /// The free-form edit request
        request: String,
    },
    /// Agent slot management
    Agent {
        #[command(subcommand)]
        command: agent_cmd::AgentCommands,
    },
    /// Mark a pending or failed task schedulable
    Schedule {
        task_id: String,
    },
    /// Run the engine (scheduler + orchestrator)
    Run {
        /// Exit once all tasks are terminal instead of running forever
        #[arg(long)]
        drain: bool,
        /// Pools to serve
        #[arg(long, default_values_t = vec!["default".to_string()])]
        pool: Vec<String>,
    },
    /// Show tasks and agents
    Status,
    /// Show a task's attempts and history
    Log {
        task_id: String,
    },
    /// Write a tar snapshot of the workspace design + state
    Snapshot,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Resolve the workspace for the project root, creating metadata on first
/// use.
fn open_workspace(
    config: &ForemanConfig,
    project_root: &std::path::Path,
) -> Result<(WorkspaceRepository, FilesystemQueue)> {
    let store = WorkspaceStore::new(&config.base_dir);
    let (workspace_id, _workspace) = store
        .open_or_create(project_root)
        .context("failed to open workspace")?;
    let dir = store.workspace_dir(&workspace_id);
    let repo = WorkspaceRepository::new(&dir, &workspace_id);
    repo.init().context("failed to init workspace layout")?;
    Ok((repo, FilesystemQueue::new(&dir)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let file = config::load_config()?;
    let config = ForemanConfig::resolve(file, cli.planner.clone(), cli.workspace_dir.clone())?;

    let project_root = match cli.project_root.clone() {
        Some(root) => root,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let project_root = project_root
        .canonicalize()
        .unwrap_or(project_root);

    let (repo, queue) = open_workspace(&config, &project_root)?;

    match cli.command {
        Commands::Init => {
            println!("workspace {} at {}", repo.workspace_id(), repo.dir().display());
            Ok(())
        }
        Commands::Plan { request } => plan_cmd::plan(&repo, &config, &request).await,
        Commands::Patch { request } => plan_cmd::patch(&repo, &config, &request).await,
        Commands::Agent { command } => agent_cmd::run(&repo, command),
        Commands::Schedule { task_id } => run_cmd::schedule(&repo, &queue, &task_id).await,
        Commands::Run { drain, pool } => {
            run_cmd::run(repo, queue, &config, project_root, pool, drain).await
        }
        Commands::Status => status_cmd::status(&repo),
        Commands::Log { task_id } => status_cmd::log(&repo, &task_id),
        Commands::Snapshot => {
            let path = repo.snapshot()?;
            println!("snapshot written to {}", path.display());
            Ok(())
        }
    }
}
