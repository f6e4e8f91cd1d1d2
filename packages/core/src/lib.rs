//! Core domain types for the adaptive task pipeline.
//!
//! This crate contains shared types used by the runtime:
//! - Job, Priority and JobResult for units of work
//! - PoolConfig for worker pool, queue, rate and batch settings
//! - PoolEvent and WorkerSnapshot for observability
//! - PipelineError for queue, pool and lane level failures

mod config;
mod error;
mod events;
mod job;

pub use config::{OverflowPolicy, PoolConfig};
pub use error::{CancelReason, PipelineError, PipelineResult};
pub use events::{PoolEvent, WorkerSnapshot};
pub use job::{Job, JobError, JobId, JobResult, Priority, WorkerId};
