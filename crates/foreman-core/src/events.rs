//! Progress events and human-readable notes.
//!
//! Pure observers: events are fire-and-forget broadcasts to whatever UI is
//! listening, and notes are best-effort appends to `notes.log`. Neither can
//! affect control flow; failures are logged and swallowed.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::warn;

use foreman_store::models::{Task, TaskStatus};

/// Events emitted toward the UI. Not persisted.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    TaskCreated {
        task: Task,
    },
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    ChatProgress {
        session_id: String,
        stage: String,
        detail: Option<String>,
    },
}

impl ProgressEvent {
    /// Wire name of the event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task:created",
            Self::TaskStatusChanged { .. } => "task:status-changed",
            Self::ChatProgress { .. } => "chat:progress",
        }
    }
}

/// Broadcast bus for progress events, optionally mirrored into the
/// workspace notes log.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
    notes: Option<NotesSink>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            notes: None,
        }
    }

    /// Bus that also appends a human-readable note per event.
    pub fn with_notes(notes: NotesSink) -> Self {
        Self {
            notes: Some(notes),
            ..Self::new()
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. No subscribers or a lagged channel drops the event.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(notes) = &self.notes {
            notes.note(&describe(&event));
        }
        let _ = self.sender.send(event);
    }

    pub fn status_changed(&self, task_id: &str, from: TaskStatus, to: TaskStatus) {
        self.emit(ProgressEvent::TaskStatusChanged {
            task_id: task_id.to_owned(),
            from,
            to,
        });
    }

    pub fn progress(&self, session_id: &str, stage: &str, detail: Option<String>) {
        self.emit(ProgressEvent::ChatProgress {
            session_id: session_id.to_owned(),
            stage: stage.to_owned(),
            detail,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable one-liner for the notes log.
fn describe(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::TaskCreated { task } => {
            format!("task {} created: {}", task.task_id, task.title)
        }
        ProgressEvent::TaskStatusChanged { task_id, from, to } => {
            format!("task {task_id}: {from} -> {to}")
        }
        ProgressEvent::ChatProgress {
            session_id,
            stage,
            detail,
        } => match detail {
            Some(detail) => format!("{session_id}: {stage} ({detail})"),
            None => format!("{session_id}: {stage}"),
        },
    }
}

/// Appends timestamped human-readable lines to `<workspace>/notes.log`.
#[derive(Debug, Clone)]
pub struct NotesSink {
    path: PathBuf,
}

impl NotesSink {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: workspace_dir.into().join("notes.log"),
        }
    }

    /// Best-effort append; an unwritable notes file never fails the caller.
    pub fn note(&self, text: &str) {
        let line = format!("[{}] {text}\n", Utc::now().to_rfc3339());
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to append note");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.status_changed("t1", TaskStatus::Pending, TaskStatus::Running);
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(ProgressEvent::TaskCreated {
            task: Task::new("t1", "n1", "demo", "default", Utc::now()),
        });
        bus.status_changed("t1", TaskStatus::Pending, TaskStatus::Running);
        bus.progress("t1", "planning", None);

        assert_eq!(rx.recv().await.unwrap().kind(), "task:created");
        assert_eq!(rx.recv().await.unwrap().kind(), "task:status-changed");
        assert_eq!(rx.recv().await.unwrap().kind(), "chat:progress");
    }

    #[test]
    fn notes_append_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = NotesSink::new(dir.path());
        sink.note("task t1 started (agent a1)");
        sink.note("task t1 succeeded");

        let contents = std::fs::read_to_string(dir.path().join("notes.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("task t1 started (agent a1)"));
        assert!(lines[1].contains("task t1 succeeded"));
    }

    #[test]
    fn bus_with_notes_mirrors_events() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::with_notes(NotesSink::new(dir.path()));
        bus.status_changed("t1", TaskStatus::Running, TaskStatus::Succeeded);
        bus.progress("t1", "assessing", Some("2 criteria".into()));

        let contents = std::fs::read_to_string(dir.path().join("notes.log")).unwrap();
        assert!(contents.contains("task t1: running -> succeeded"));
        assert!(contents.contains("t1: assessing (2 criteria)"));
    }

    #[test]
    fn notes_sink_is_best_effort() {
        // Point at a directory that cannot exist as a file parent.
        let sink = NotesSink::new("/dev/null/nope");
        sink.note("dropped");
    }
}
