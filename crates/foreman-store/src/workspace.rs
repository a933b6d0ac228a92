//! Workspace resolution: maps a project root to its workspace directory.
//!
//! Workspaces are keyed by a stable fingerprint of the project root path so
//! the same project always resolves to the same directory, regardless of
//! where the CLI is invoked from.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::StoreError;
use crate::fsutil;

/// Scheduling semantics recorded in workspace metadata: tasks move directly
/// from `pending` to `running` at dispatch (no intermediate `ready` state).
pub const SCHEDULING_DIRECT_DISPATCH: &str = "direct-dispatch";

/// Compute the workspace fingerprint for a project root:
/// `sha1(path)` truncated to 12 hex chars.
pub fn workspace_fingerprint(project_root: &Path) -> String {
    let mut hasher = Sha1::new();
    hasher.update(project_root.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_owned()
}

/// Workspace metadata persisted as `workspace.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub version: String,
    pub project_root: PathBuf,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_opened_at: DateTime<Utc>,
    /// Documented resolution of the ready-vs-running scheduling question.
    #[serde(default = "default_scheduling")]
    pub scheduling: String,
}

fn default_scheduling() -> String {
    SCHEDULING_DIRECT_DISPATCH.to_owned()
}

impl Workspace {
    pub fn new(project_root: impl Into<PathBuf>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: "1".to_owned(),
            project_root: project_root.into(),
            display_name: display_name.into(),
            created_at: now,
            last_opened_at: now,
            scheduling: default_scheduling(),
        }
    }
}

/// Resolves and persists workspaces under a base directory
/// (typically `~/.foreman/workspaces`).
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    base_dir: PathBuf,
}

impl WorkspaceStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory for a given workspace ID.
    pub fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.base_dir.join(workspace_id)
    }

    /// Load workspace metadata by ID. `Ok(None)` if never created.
    pub fn load(&self, workspace_id: &str) -> Result<Option<Workspace>, StoreError> {
        fsutil::read_json(&self.workspace_dir(workspace_id).join("workspace.json"))
    }

    /// Persist workspace metadata, creating the workspace directory as
    /// needed. Returns the workspace ID.
    pub fn save(&self, workspace: &Workspace) -> Result<String, StoreError> {
        let id = workspace_fingerprint(&workspace.project_root);
        let path = self.workspace_dir(&id).join("workspace.json");
        fsutil::atomic_write_json(&path, workspace, "workspace metadata")?;
        Ok(id)
    }

    /// Resolve a project root to its workspace, creating metadata on first
    /// use and refreshing `last_opened_at` otherwise.
    pub fn open_or_create(
        &self,
        project_root: &Path,
    ) -> Result<(String, Workspace), StoreError> {
        let id = workspace_fingerprint(project_root);
        let workspace = match self.load(&id)? {
            Some(mut ws) => {
                ws.last_opened_at = Utc::now();
                ws
            }
            None => {
                let name = project_root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| project_root.to_string_lossy().into_owned());
                Workspace::new(project_root, name)
            }
        };
        self.save(&workspace)?;
        Ok((id, workspace))
    }
}
