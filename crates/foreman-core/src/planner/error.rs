//! Planner error taxonomy and retry classification.

use thiserror::Error;

/// Errors surfaced by planning-model calls.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// Generic transport failure (connection refused, subprocess I/O, ...).
    #[error("planning model transport error: {0}")]
    Transport(String),

    /// The request exceeded its deadline.
    #[error("planning model request timed out")]
    Timeout,

    /// Non-success HTTP status from an HTTP-based backend.
    #[error("planning model returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The driving context was canceled. Never retried.
    #[error("planning model call was canceled")]
    Canceled,

    /// The response carried no recognizable payload. Never retried.
    #[error("malformed planning payload: {0}")]
    MalformedPayload(String),

    /// The payload decoded but carried the wrong operation tag.
    #[error("unexpected payload type {got:?}, expected {expected:?}")]
    UnexpectedType { expected: &'static str, got: String },
}

impl PlannerError {
    /// Whether a retry with backoff may succeed: timeouts, HTTP 5xx, 429,
    /// and generic transport errors are retryable; cancellation and
    /// malformed payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Http { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Canceled | Self::MalformedPayload(_) | Self::UnexpectedType { .. } => false,
        }
    }
}
