//! `foreman agent`: manage the workspace's agent slots.

use anyhow::{Result, bail};
use clap::Subcommand;

use foreman_store::WorkspaceRepository;
use foreman_store::models::Agent;

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Register an agent slot
    Add {
        /// Agent ID (e.g. "a1")
        agent_id: String,
        /// Capability tag matched against task kinds
        #[arg(long, default_value = "default")]
        kind: String,
        /// Maximum concurrent tasks
        #[arg(long, default_value_t = 1)]
        max_parallel: usize,
    },
    /// List agent slots
    List,
    /// Remove an agent slot (must be idle)
    Remove {
        agent_id: String,
    },
}

pub fn run(repo: &WorkspaceRepository, command: AgentCommands) -> Result<()> {
    match command {
        AgentCommands::Add {
            agent_id,
            kind,
            max_parallel,
        } => {
            let mut agents = repo.state().load_agents()?;
            if agents.agents.iter().any(|a| a.agent_id == agent_id) {
                bail!("agent {agent_id} already exists");
            }
            agents.agents.push(Agent {
                agent_id: agent_id.clone(),
                kind,
                max_parallel,
                running_tasks: Vec::new(),
            });
            repo.state().save_agents(&agents)?;
            println!("agent {agent_id} added");
            Ok(())
        }
        AgentCommands::List => {
            let agents = repo.state().load_agents()?;
            if agents.agents.is_empty() {
                println!("no agents registered");
                return Ok(());
            }
            for agent in &agents.agents {
                println!(
                    "{}  kind={}  {}/{} running",
                    agent.agent_id,
                    agent.kind,
                    agent.running_tasks.len(),
                    agent.max_parallel
                );
            }
            Ok(())
        }
        AgentCommands::Remove { agent_id } => {
            let mut agents = repo.state().load_agents()?;
            let Some(agent) = agents.agents.iter().find(|a| a.agent_id == agent_id) else {
                bail!("agent {agent_id} not found");
            };
            if !agent.running_tasks.is_empty() {
                bail!(
                    "agent {agent_id} is running {} task(s)",
                    agent.running_tasks.len()
                );
            }
            agents.agents.retain(|a| a.agent_id != agent_id);
            repo.state().save_agents(&agents)?;
            println!("agent {agent_id} removed");
            Ok(())
        }
    }
}
