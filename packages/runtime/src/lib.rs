//! Async runtime for the adaptive task pipeline.
//!
//! This crate provides the concurrency machinery: cancellation trees, the
//! priority queue, rate gate and batcher, the Ractor-based worker pool, and
//! fan-out / fan-in composition.
//!
//! # Architecture
//!
//! - `WorkerPool` - Handle for submitting jobs and shutting a pool down
//! - `PoolSupervisor` - Actor that spawns, scales and replaces workers
//! - `WorkerActor` - Pulls items from the pool queue and runs the handler
//! - `FanOutRouter` / `FanInAggregator` - Split a job stream into lanes and merge results
//!
//! # Usage
//!
//! ```ignore
//! use pipeline_runtime::{WorkerPool, PoolConfig, Job, job_handler};
//!
//! let handler = job_handler!("resize", |job, token| {
//!     resize(&job.payload, &token).await.map_err(|e| e.to_string())
//! });
//! let pool = WorkerPool::start(PoolConfig::default(), Arc::new(handler)).await?;
//! let result = pool.submit(Job::new("resize", payload)).await?.await?;
//! pool.close().await?;
//! ```

mod batch;
mod cancel;
mod fan_in;
mod fan_out;
mod handler;
mod messages;
mod pipeline;
mod pool;
mod priority_queue;
mod rate_gate;
mod scaling;
mod supervisor;
mod worker_actor;

pub use batch::{Accumulator, Batch, BatchAccumulator, FlushTrigger};
pub use cancel::{CancelHandle, CancellationToken, LinkGuard};
pub use fan_in::{FanInAggregator, LaneOutcome, LaneSummary, MergedStream, ResultStream};
pub use fan_out::{FanOutRouter, JobStream, KeyFn, RoutingStrategy};
pub use handler::{
    BatchFuture, FnHandler, HandlerFuture, HandlerResult, JobHandler, JobHandlerRegistry,
};
pub use messages::{PoolStats, WorkerStats};
pub use pipeline::Pipeline;
pub use pool::{JobHandle, WorkerPool};
pub use priority_queue::{Prioritized, PriorityQueue, QueueDepth};
pub use rate_gate::RateGate;
pub use scaling::{InvalidTransition, ScaleDecision, WorkerEvent, WorkerState};

/// Re-export core types for convenience.
pub use pipeline_core::{
    CancelReason, Job, JobError, JobId, JobResult, OverflowPolicy, PipelineError, PipelineResult,
    PoolConfig, PoolEvent, Priority, WorkerId, WorkerSnapshot,
};
