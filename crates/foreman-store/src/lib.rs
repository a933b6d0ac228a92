//! Filesystem persistence for foreman workspaces.
//!
//! A workspace is a directory keyed by a fingerprint of the project root.
//! Inside it live the design (WBS + node files), the runtime state (tasks,
//! agents, node statuses), an append-only action history, the per-task
//! attempt logs, and the filesystem job queue used to hand work from the
//! scheduler to the orchestrator.

pub mod error;
pub mod models;
pub mod queue;
pub mod repo;
pub mod workspace;

mod fsutil;

pub use error::StoreError;
pub use queue::{FilesystemQueue, QueueError};
pub use repo::WorkspaceRepository;
pub use workspace::{Workspace, WorkspaceStore, workspace_fingerprint};
