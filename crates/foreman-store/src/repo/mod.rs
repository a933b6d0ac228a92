//! The workspace repository: exclusive owner of all persisted entities.
//!
//! All mutation of design, state, and history goes through this type. State
//! saves replace whole collections atomically; callers perform
//! read-modify-write cycles under the workspace lock.

mod attempts;
mod design;
mod history;
mod snapshot;
mod state;

use std::fs;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::StoreError;

pub use attempts::AttemptLog;
pub use design::DesignStore;
pub use history::HistoryStore;
pub use state::StateStore;

/// Handle to one workspace's on-disk repository.
#[derive(Debug, Clone)]
pub struct WorkspaceRepository {
    dir: PathBuf,
    workspace_id: String,
}

impl WorkspaceRepository {
    pub fn new(dir: impl Into<PathBuf>, workspace_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            workspace_id: workspace_id.into(),
        }
    }

    /// Idempotently create the repository directory tree.
    pub fn init(&self) -> Result<(), StoreError> {
        for sub in [
            "design",
            "design/nodes",
            "state",
            "history",
            "snapshots",
            "ipc/queue",
            "ipc/processing",
            "tasks",
        ] {
            let path = self.dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Static design data: the WBS and per-node files.
    pub fn design(&self) -> DesignStore<'_> {
        DesignStore::new(&self.dir)
    }

    /// Runtime state: tasks, agents, node statuses.
    pub fn state(&self) -> StateStore<'_> {
        StateStore::new(&self.dir)
    }

    /// Append-only action history.
    pub fn history(&self) -> HistoryStore<'_> {
        HistoryStore::new(&self.dir)
    }

    /// Per-task attempt logs (`tasks/<task_id>.jsonl`).
    pub fn attempts(&self) -> AttemptLog<'_> {
        AttemptLog::new(&self.dir)
    }

    /// Write a tar snapshot of metadata, design, and state into
    /// `snapshots/`. Returns the snapshot path.
    pub fn snapshot(&self) -> Result<PathBuf, StoreError> {
        snapshot::write_snapshot(&self.dir)
    }

    /// Acquire the exclusive workspace lock (`state/.lock`). One engine
    /// instance owns a workspace's state at a time; a second acquisition
    /// from another process fails with [`StoreError::Locked`].
    pub fn lock(&self) -> Result<WorkspaceLock, StoreError> {
        WorkspaceLock::acquire(&self.dir.join("state"))
    }
}

/// Advisory exclusive lock over a workspace's state directory. Released on
/// drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: fs::File,
    path: PathBuf,
}

impl WorkspaceLock {
    fn acquire(state_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(state_dir).map_err(|e| StoreError::io(state_dir, e))?;
        let path = state_dir.join(".lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::Locked { path: path.clone() })?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, WorkspaceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = WorkspaceRepository::new(dir.path(), "abc123def456");
        repo.init().unwrap();
        (dir, repo)
    }

    fn tree_of(dir: &Path) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in fs::read_dir(&current).unwrap() {
                let entry = entry.unwrap();
                out.push(
                    entry
                        .path()
                        .strip_prefix(dir)
                        .unwrap()
                        .to_string_lossy()
                        .into_owned(),
                );
                if entry.file_type().unwrap().is_dir() {
                    stack.push(entry.path());
                }
            }
        }
        out.sort();
        out
    }

    #[test]
    fn init_creates_the_layout() {
        let (dir, _repo) = repo();
        for sub in ["design/nodes", "state", "history", "snapshots", "ipc/queue", "tasks"] {
            assert!(dir.path().join(sub).is_dir(), "{sub} should exist");
        }
    }

    #[test]
    fn init_is_idempotent() {
        let (dir, repo) = repo();
        let before = tree_of(dir.path());
        repo.init().unwrap();
        assert_eq!(tree_of(dir.path()), before);
    }

    #[test]
    fn lock_is_exclusive_while_held() {
        let (_dir, repo) = repo();
        let guard = repo.lock().unwrap();
        assert!(guard.path().ends_with("state/.lock"));
        // fs2 locks are per-process handles on some platforms, so exclusion
        // against a second process is not testable here; release and
        // re-acquire must always work.
        drop(guard);
        let _guard = repo.lock().unwrap();
    }
}
