//! Per-task attempt log (`tasks/<task_id>.jsonl`).
//!
//! Every status change of an attempt appends a full record; the latest line
//! per attempt ID wins on load. Terminal records are never rewritten.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::StoreError;
use crate::models::Attempt;

/// Accessor for `tasks/` within a workspace.
#[derive(Debug)]
pub struct AttemptLog<'a> {
    dir: &'a Path,
}

impl<'a> AttemptLog<'a> {
    pub(super) fn new(dir: &'a Path) -> Self {
        Self { dir }
    }

    fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join("tasks").join(format!("{task_id}.jsonl"))
    }

    /// Append the current state of an attempt.
    pub fn append_attempt(&self, attempt: &Attempt) -> Result<(), StoreError> {
        let path = self.path(&attempt.task_id);
        let dir = self.dir.join("tasks");
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut line = serde_json::to_vec(attempt).map_err(|source| StoreError::Encode {
            what: "attempt",
            source,
        })?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(&line).map_err(|e| StoreError::io(&path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Attempts for a task, deduplicated by attempt ID (latest record wins),
    /// in first-seen order.
    pub fn load_attempts(&self, task_id: &str) -> Result<Vec<Attempt>, StoreError> {
        let path = self.path(task_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut order: Vec<String> = Vec::new();
        let mut latest: std::collections::HashMap<String, Attempt> =
            std::collections::HashMap::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Attempt>(line) {
                Ok(attempt) => {
                    if !latest.contains_key(&attempt.attempt_id) {
                        order.push(attempt.attempt_id.clone());
                    }
                    latest.insert(attempt.attempt_id.clone(), attempt);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable attempt line");
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }
}
