//! Queue, pool and lane level errors.

use serde::{Deserialize, Serialize};

use crate::JobError;

/// Why a cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Explicit cancellation of the token or an ancestor.
    Cancelled,
    /// The token's effective deadline passed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Error type for queue, pool and lane operations.
///
/// Job-level failures are not represented here; they travel inside
/// [`crate::JobResult`] as a [`JobError`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Queue is full")]
    QueueFull,

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Worker fault: {0}")]
    WorkerFault(String),

    #[error("Lane {lane} failed: {reason}")]
    LaneFailed { lane: usize, reason: String },

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    /// Check if the error came from a fired cancellation token.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled | PipelineError::DeadlineExceeded)
    }
}

impl From<CancelReason> for PipelineError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => PipelineError::Cancelled,
            CancelReason::DeadlineExceeded => PipelineError::DeadlineExceeded,
        }
    }
}

impl From<CancelReason> for JobError {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Cancelled => JobError::Cancelled,
            CancelReason::DeadlineExceeded => JobError::DeadlineExceeded,
        }
    }
}
