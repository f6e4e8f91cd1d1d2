//! Event types for pool observability.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobError, JobId, WorkerId};

/// Per-worker counters, published after each job and when the worker exits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    /// Jobs this worker has finished, successful or not.
    pub jobs_processed: u64,
    /// Jobs that finished with an error.
    pub errors: u64,
    /// Wall time spent inside job handlers.
    pub total_busy_time: Duration,
}

impl WorkerSnapshot {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            ..Default::default()
        }
    }

    /// Fold one finished job into the counters.
    pub fn record(&mut self, busy: Duration, failed: bool) {
        self.jobs_processed += 1;
        if failed {
            self.errors += 1;
        }
        self.total_busy_time += busy;
    }
}

/// Events emitted by a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// A worker was spawned.
    WorkerStarted {
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
    /// A worker was asked to retire after its current job.
    WorkerRetired {
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
    /// A worker left the pool.
    WorkerExited {
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
    /// The scaling controller changed the active worker count.
    Scaled {
        from: usize,
        to: usize,
        pending: usize,
        timestamp: DateTime<Utc>,
    },
    /// A job started executing.
    JobStarted {
        job_id: JobId,
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: JobId,
        worker_id: WorkerId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A job finished with an error.
    JobFailed {
        job_id: JobId,
        worker_id: WorkerId,
        error: JobError,
        timestamp: DateTime<Utc>,
    },
    /// Counters for one worker.
    WorkerSnapshot {
        snapshot: WorkerSnapshot,
        timestamp: DateTime<Utc>,
    },
}

impl PoolEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PoolEvent::WorkerStarted { timestamp, .. } => *timestamp,
            PoolEvent::WorkerRetired { timestamp, .. } => *timestamp,
            PoolEvent::WorkerExited { timestamp, .. } => *timestamp,
            PoolEvent::Scaled { timestamp, .. } => *timestamp,
            PoolEvent::JobStarted { timestamp, .. } => *timestamp,
            PoolEvent::JobCompleted { timestamp, .. } => *timestamp,
            PoolEvent::JobFailed { timestamp, .. } => *timestamp,
            PoolEvent::WorkerSnapshot { timestamp, .. } => *timestamp,
        }
    }

    /// Get the worker associated with this event, if any.
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            PoolEvent::WorkerStarted { worker_id, .. } => Some(*worker_id),
            PoolEvent::WorkerRetired { worker_id, .. } => Some(*worker_id),
            PoolEvent::WorkerExited { worker_id, .. } => Some(*worker_id),
            PoolEvent::JobStarted { worker_id, .. } => Some(*worker_id),
            PoolEvent::JobCompleted { worker_id, .. } => Some(*worker_id),
            PoolEvent::JobFailed { worker_id, .. } => Some(*worker_id),
            PoolEvent::WorkerSnapshot { snapshot, .. } => Some(snapshot.worker_id),
            PoolEvent::Scaled { .. } => None,
        }
    }

    /// Get the job ID associated with this event, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            PoolEvent::JobStarted { job_id, .. } => Some(*job_id),
            PoolEvent::JobCompleted { job_id, .. } => Some(*job_id),
            PoolEvent::JobFailed { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            PoolEvent::WorkerStarted { worker_id, .. } => format!("{} started", worker_id),
            PoolEvent::WorkerRetired { worker_id, .. } => format!("{} retiring", worker_id),
            PoolEvent::WorkerExited { worker_id, .. } => format!("{} exited", worker_id),
            PoolEvent::Scaled {
                from, to, pending, ..
            } => format!("Scaled {} -> {} workers ({} pending)", from, to, pending),
            PoolEvent::JobStarted {
                job_id, worker_id, ..
            } => format!("Job {} started by {}", job_id, worker_id),
            PoolEvent::JobCompleted {
                job_id,
                duration_ms,
                ..
            } => format!("Job {} completed in {}ms", job_id, duration_ms),
            PoolEvent::JobFailed { job_id, error, .. } => {
                format!("Job {} failed: {}", job_id, error)
            }
            PoolEvent::WorkerSnapshot { snapshot, .. } => format!(
                "{}: {} processed, {} errors",
                snapshot.worker_id, snapshot.jobs_processed, snapshot.errors
            ),
        }
    }
}
