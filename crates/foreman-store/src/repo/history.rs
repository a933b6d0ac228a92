//! History sub-repository: the append-only action log.
//!
//! Actions are appended one JSON object per line to a day-partitioned file,
//! synced before returning so a "started" record is durable before the state
//! write that follows it. Readers tolerate trailing garbage from a crashed
//! writer by skipping unparseable lines.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::StoreError;
use crate::models::Action;

/// Accessor for `history/` within a workspace.
#[derive(Debug)]
pub struct HistoryStore<'a> {
    dir: &'a Path,
}

impl<'a> HistoryStore<'a> {
    pub(super) fn new(dir: &'a Path) -> Self {
        Self { dir }
    }

    fn history_dir(&self) -> PathBuf {
        self.dir.join("history")
    }

    fn day_file(&self, at: DateTime<Utc>) -> PathBuf {
        self.history_dir()
            .join(format!("actions-{}.jsonl", at.format("%Y-%m-%d")))
    }

    /// Append an action. Durable (file synced) before returning.
    pub fn append_action(&self, action: &Action) -> Result<(), StoreError> {
        let path = self.day_file(action.at);
        let dir = self.history_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut line = serde_json::to_vec(action).map_err(|source| StoreError::Encode {
            what: "action",
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

    /// Actions with `from <= at <= to`, in file-append order (day files are
    /// read in name order, which is chronological).
    pub fn list_actions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Action>, StoreError> {
        let dir = self.history_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("actions-") && n.ends_with(".jsonl"))
            })
            .collect();
        files.sort();

        let mut actions = Vec::new();
        for path in files {
            let contents =
                fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            for line in contents.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Action>(line) {
                    Ok(action) => {
                        if action.at >= from && action.at <= to {
                            actions.push(action);
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unparseable history line");
                    }
                }
            }
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::super::WorkspaceRepository;
    use crate::models::{Action, action_kind};
    use chrono::{Duration, Utc};

    fn repo() -> (tempfile::TempDir, WorkspaceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = WorkspaceRepository::new(dir.path(), "abc123def456");
        repo.init().unwrap();
        (dir, repo)
    }

    fn action(kind: &str) -> Action {
        let mut payload = serde_json::Map::new();
        payload.insert("task_id".to_owned(), serde_json::json!("t1"));
        Action::new(kind, "abc123def456", payload)
    }

    #[test]
    fn append_then_list_round_trips() {
        let (_dir, repo) = repo();
        let started = action(action_kind::TASK_STARTED);
        repo.history().append_action(&started).unwrap();

        let now = Utc::now();
        let actions = repo
            .history()
            .list_actions(now - Duration::hours(1), now + Duration::hours(1))
            .unwrap();
        assert_eq!(actions, vec![started]);
    }

    #[test]
    fn list_preserves_append_order_with_nondecreasing_timestamps() {
        let (_dir, repo) = repo();
        for kind in [
            action_kind::TASK_STARTED,
            action_kind::TASK_ATTEMPT_STARTED,
            action_kind::TASK_SUCCEEDED,
        ] {
            repo.history().append_action(&action(kind)).unwrap();
        }

        let now = Utc::now();
        let actions = repo
            .history()
            .list_actions(now - Duration::hours(1), now + Duration::hours(1))
            .unwrap();
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0].kind, action_kind::TASK_STARTED);
        assert_eq!(actions[2].kind, action_kind::TASK_SUCCEEDED);
        assert!(actions.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[test]
    fn list_filters_by_range() {
        let (_dir, repo) = repo();
        repo.history()
            .append_action(&action(action_kind::TASK_STARTED))
            .unwrap();

        let far_past = Utc::now() - Duration::days(30);
        let actions = repo
            .history()
            .list_actions(far_past, far_past + Duration::hours(1))
            .unwrap();
        assert!(actions.is_empty());
    }

    #[test]
    fn unparseable_lines_are_skipped() {
        let (dir, repo) = repo();
        repo.history()
            .append_action(&action(action_kind::TASK_STARTED))
            .unwrap();

        // Simulate a torn write at the tail of the day file.
        let day = Utc::now().format("%Y-%m-%d");
        let path = dir.path().join("history").join(format!("actions-{day}.jsonl"));
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{\"id\":\"torn");
        std::fs::write(&path, contents).unwrap();

        let now = Utc::now();
        let actions = repo
            .history()
            .list_actions(now - Duration::hours(1), now + Duration::hours(1))
            .unwrap();
        assert_eq!(actions.len(), 1);
    }
}
