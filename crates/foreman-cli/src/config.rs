//! Configuration file management for foreman.
//!
//! TOML config at `~/.config/foreman/config.toml` (XDG layout), with the
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use foreman_core::planner::PlannerConfig;
use foreman_core::worker::{CliKind, WorkerConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub workspace: WorkspaceSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub worker: WorkerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WorkspaceSection {
    /// Base directory for workspaces; defaults to `~/.foreman/workspaces`.
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlannerSection {
    /// openai-chat, codex-cli, claude-code, cursor-cli, or mock.
    pub backend: String,
    pub model: Option<String>,
    /// Env var holding the API key (never the key itself).
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    pub cli_path: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    pub timeout_sec: Option<u64>,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            backend: "openai-chat".to_owned(),
            model: None,
            api_key_env: Some("OPENAI_API_KEY".to_owned()),
            base_url: None,
            cli_path: None,
            flags: Vec::new(),
            timeout_sec: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerSection {
    /// Default agent CLI: codex, claude-code, or cursor-cli.
    pub cli: String,
    /// Sandbox mode: local-subprocess or container.
    pub sandbox: String,
    pub docker_image: Option<String>,
    pub max_run_time_sec: Option<u64>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            cli: "codex".to_owned(),
            sandbox: "local-subprocess".to_owned(),
            docker_image: None,
            max_run_time_sec: None,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// `$XDG_CONFIG_HOME/foreman` or `~/.config/foreman`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default workspace base directory: `~/.foreman/workspaces`.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".foreman")
        .join("workspaces")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load the config file; absent file yields defaults.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read config at {}", path.display()));
        }
    };
    toml::from_str(&contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    let path = config_path();
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write config at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ForemanConfig {
    pub base_dir: PathBuf,
    pub planner: PlannerConfig,
    pub worker: WorkerConfig,
    pub sandbox_mode: String,
    pub docker_image: Option<String>,
}

impl ForemanConfig {
    /// Resolve from the config file plus CLI overrides.
    pub fn resolve(
        file: ConfigFile,
        planner_override: Option<String>,
        base_dir_override: Option<PathBuf>,
    ) -> Result<Self> {
        let base_dir = base_dir_override
            .or(file.workspace.base_dir)
            .unwrap_or_else(default_base_dir);

        let api_key = file
            .planner
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());

        let planner = PlannerConfig {
            backend: planner_override.unwrap_or(file.planner.backend),
            model: file.planner.model,
            api_key,
            base_url: file.planner.base_url,
            cli_path: file.planner.cli_path,
            flags: file.planner.flags,
            timeout: Duration::from_secs(file.planner.timeout_sec.unwrap_or(60)),
        };

        let cli: CliKind = file
            .worker
            .cli
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid worker.cli: {e}"))?;
        let worker = WorkerConfig {
            cli,
            max_run_time: Duration::from_secs(file.worker.max_run_time_sec.unwrap_or(1800)),
        };

        Ok(Self {
            base_dir,
            planner,
            worker,
            sandbox_mode: file.worker.sandbox,
            docker_image: file.worker.docker_image,
        })
    }
}
