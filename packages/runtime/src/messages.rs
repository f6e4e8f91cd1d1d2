//! Message types for actor communication.

use pipeline_core::{WorkerId, WorkerSnapshot};
use ractor::RpcReplyPort;
use serde::Serialize;

use crate::scaling::WorkerState;

/// Messages for the pool supervisor.
#[derive(Debug)]
pub(crate) enum PoolMessage {
    /// Periodic load sample for the scaling controller.
    Tick,

    /// A worker dequeued an item and started processing it.
    WorkerBusy { worker_id: WorkerId },

    /// A worker finished its item.
    WorkerIdle { worker_id: WorkerId },

    /// A worker left its loop and is stopping.
    WorkerExited { worker_id: WorkerId },

    /// Get pool stats.
    GetStats { reply: RpcReplyPort<PoolStats> },

    /// Stop scaling and reply once every worker has exited.
    AwaitDrained { reply: RpcReplyPort<()> },
}

/// Messages for the WorkerActor.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// Take the next item from the queue.
    Pull,
}

/// State of one worker as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    pub state: WorkerState,
    #[serde(flatten)]
    pub snapshot: WorkerSnapshot,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Workers that are idle or processing.
    pub active_workers: usize,
    /// Items waiting in the queue. A batch counts as one item.
    pub pending: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Totals across live and exited workers.
    pub jobs_processed: u64,
    pub errors: u64,
    pub workers: Vec<WorkerStats>,
}
