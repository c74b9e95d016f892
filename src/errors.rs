//! Error taxonomy shared by every pipeline component.
//!
//! Errors are split into two families:
//!
//! - **Transient** failures (connection drops, fetch timeouts, sink hiccups)
//!   are absorbed by retry at the layer closest to the operation.
//! - **Permanent** failures (validation, missing egress endpoint, malformed
//!   requests, cancellation) are never retried and surface immediately.
//!
//! [`PipelineError::is_retryable`] encodes that split so retry loops do not
//! need to know about individual variants.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A message failed its queue schema before any network effect.
    #[error("message for {queue} is missing or has invalid field '{field}'")]
    Validation { queue: String, field: String },

    /// Connecting to the broker (or opening a channel) failed.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// Publishing failed after the connection was established.
    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    /// A delivered payload could not be decoded.
    #[error("undecodable payload: {0}")]
    Decode(String),

    /// The resource pool had no active endpoint to hand out.
    #[error("no active egress endpoint available")]
    NoEndpoint,

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("operation cancelled")]
    Cancelled,

    /// The caller asked for something that can never succeed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether a retry loop should attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Validation { .. }
                | PipelineError::NoEndpoint
                | PipelineError::InvalidRequest(_)
                | PipelineError::Cancelled
                | PipelineError::Config(_)
                | PipelineError::Decode(_)
        )
    }

    pub fn validation(queue: &str, field: &str) -> Self {
        PipelineError::Validation {
            queue: queue.to_string(),
            field: field.to_string(),
        }
    }

    pub fn publish(queue: &str, reason: impl ToString) -> Self {
        PipelineError::Publish {
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }
}
