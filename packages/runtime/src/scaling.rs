//! Worker lifecycle and scaling decisions.

use std::collections::BTreeMap;

use pipeline_core::{PoolConfig, WorkerId};
use serde::Serialize;

/// Lifecycle of a worker.
///
/// ```text
/// Idle -> Processing -> Idle
/// Idle | Processing -> Retiring -> Exited
/// any -> Exited
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Processing,
    /// Finishes its current item, then exits.
    Retiring,
    Exited,
}

/// Inputs that move a worker between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    Dequeued,
    Finished,
    Retire,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid worker transition: {event:?} in state {state:?}")]
pub struct InvalidTransition {
    pub state: WorkerState,
    pub event: WorkerEvent,
}

impl WorkerState {
    pub fn on(self, event: WorkerEvent) -> Result<WorkerState, InvalidTransition> {
        use WorkerEvent::*;
        use WorkerState::*;

        match (self, event) {
            (Exited, _) => Err(InvalidTransition { state: self, event }),
            (_, Exit) => Ok(Exited),
            (Idle, Dequeued) => Ok(Processing),
            (Processing, Finished) => Ok(Idle),
            (Idle | Processing, Retire) => Ok(Retiring),
            // A retiring worker may still report the item it took before the signal.
            (Retiring, Dequeued | Finished | Retire) => Ok(Retiring),
            (Idle, Finished) | (Processing, Dequeued) => {
                Err(InvalidTransition { state: self, event })
            }
        }
    }

    /// Counted toward the pool's active workers.
    pub fn is_active(self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Processing)
    }
}

/// Outcome of one scaling check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Grow,
    Shrink,
    Hold,
}

/// Decide whether to add or retire one worker.
///
/// Load is `pending / active`. The pool grows above the high water ratio and
/// shrinks below the low water ratio, staying within `[min_workers, max_workers]`.
pub fn decide(pending: usize, active: usize, config: &PoolConfig) -> ScaleDecision {
    if active < config.min_workers {
        return ScaleDecision::Grow;
    }
    let load = pending as f64 / active as f64;
    if load > config.high_water_ratio && active < config.max_workers {
        ScaleDecision::Grow
    } else if load < config.low_water_ratio && active > config.min_workers {
        ScaleDecision::Shrink
    } else {
        ScaleDecision::Hold
    }
}

/// Choose the worker to retire: the newest idle worker, else the newest busy one.
pub fn pick_retiree(workers: &BTreeMap<WorkerId, WorkerState>) -> Option<WorkerId> {
    let newest = |wanted: WorkerState| {
        workers
            .iter()
            .rev()
            .find(|(_, state)| **state == wanted)
            .map(|(id, _)| *id)
    };
    newest(WorkerState::Idle).or_else(|| newest(WorkerState::Processing))
}
