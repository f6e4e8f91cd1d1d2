//! Job domain types for units of work flowing through the pipeline.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a worker inside a pool. Unique for the lifetime of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Priority lane a job is queued on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Low = 0,
    High = 1,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// A job represents a unit of work submitted for processing.
///
/// Jobs are immutable once enqueued and consumed exactly once by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Type of job (used for routing to handlers).
    pub job_type: String,
    /// Job payload as JSON.
    pub payload: serde_json::Value,
    /// Queue lane.
    pub priority: Priority,
    /// When the job was created by its producer.
    pub enqueued_at: DateTime<Utc>,
    /// Optional per-job processing deadline in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Optional tags for filtering and affinity routing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Job {
    /// Create a new low priority job.
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            priority: Priority::default(),
            enqueued_at: Utc::now(),
            timeout_ms: None,
            tags: Vec::new(),
        }
    }

    /// Set the priority for this job.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the processing timeout for this job.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Add tags to this job.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Processing timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Job-level failure, carried inside a [`JobResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum JobError {
    /// The handler returned an error.
    #[error("job failed: {0}")]
    Failed(String),
    /// The handler panicked; the worker recovered and kept serving.
    #[error("worker fault: {0}")]
    WorkerFault(String),
    /// The job observed cancellation before or while running.
    #[error("job cancelled")]
    Cancelled,
    /// The job ran past its deadline.
    #[error("job deadline exceeded")]
    DeadlineExceeded,
}

/// Outcome of processing one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// The job this result belongs to.
    pub job_id: JobId,
    /// Output value on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Failure descriptor, if the job did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Worker that produced this result.
    pub worker_id: WorkerId,
    /// Time spent processing.
    pub duration: Duration,
}

impl JobResult {
    pub fn success(
        job_id: JobId,
        worker_id: WorkerId,
        value: Option<serde_json::Value>,
        duration: Duration,
    ) -> Self {
        Self {
            job_id,
            value,
            error: None,
            worker_id,
            duration,
        }
    }

    pub fn failure(
        job_id: JobId,
        worker_id: WorkerId,
        error: JobError,
        duration: Duration,
    ) -> Self {
        Self {
            job_id,
            value: None,
            error: Some(error),
            worker_id,
            duration,
        }
    }

    /// Check if the job succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Check if the job failed because its worker faulted.
    pub fn is_worker_fault(&self) -> bool {
        matches!(self.error, Some(JobError::WorkerFault(_)))
    }
}
