//! Error type shared by the repository and workspace store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by workspace persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("workspace state is locked by another process ({path:?})")]
    Locked { path: PathBuf },

    #[error("node {0:?} not found in design")]
    NodeNotFound(String),

    #[error("no WBS has been saved for this workspace")]
    WbsNotFound,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Decode {
            path: path.into(),
            source,
        }
    }
}
