//! Supervisor actor that owns a pool's workers and scales them with load.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use pipeline_core::{PipelineError, PoolConfig, PoolEvent, WorkerId};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use tokio::sync::broadcast;

use crate::cancel::CancellationToken;
use crate::handler::JobHandler;
use crate::messages::{PoolMessage, PoolStats, WorkerMessage, WorkerStats};
use crate::pool::WorkItem;
use crate::priority_queue::PriorityQueue;
use crate::rate_gate::RateGate;
use crate::scaling::{self, ScaleDecision, WorkerEvent, WorkerState};
use crate::worker_actor::{WorkerActor, WorkerArgs, WorkerReport};

/// Worker counts published by the supervisor for lock-free reads.
#[derive(Debug, Default)]
pub(crate) struct PoolGauges {
    active: AtomicUsize,
    live: AtomicUsize,
}

impl PoolGauges {
    /// Workers that are idle or processing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Workers that have not exited, including retiring ones.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

struct WorkerEntry {
    state: WorkerState,
    retire: CancellationToken,
    actor: ActorRef<WorkerMessage>,
    report: Arc<WorkerReport>,
}

/// State for the supervisor actor.
pub(crate) struct SupervisorState {
    config: PoolConfig,
    queue: Arc<PriorityQueue<WorkItem>>,
    gate: Option<Arc<RateGate>>,
    handler: Arc<dyn JobHandler>,
    token: CancellationToken,
    event_tx: broadcast::Sender<PoolEvent>,
    gauges: Arc<PoolGauges>,
    workers: BTreeMap<WorkerId, WorkerEntry>,
    /// Worker counter for unique IDs.
    worker_counter: u64,
    draining: bool,
    drain_waiters: Vec<RpcReplyPort<()>>,
    /// Counters of workers that already exited.
    exited_jobs: u64,
    exited_errors: u64,
}

impl SupervisorState {
    fn next_worker_id(&mut self) -> WorkerId {
        self.worker_counter += 1;
        WorkerId(self.worker_counter)
    }

    fn active(&self) -> usize {
        self.workers.values().filter(|w| w.state.is_active()).count()
    }

    fn publish(&self) {
        self.gauges.active.store(self.active(), Ordering::Release);
        self.gauges.live.store(self.workers.len(), Ordering::Release);
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.event_tx.send(event);
    }

    fn transition(&mut self, worker_id: WorkerId, event: WorkerEvent) {
        if let Some(entry) = self.workers.get_mut(&worker_id) {
            match entry.state.on(event) {
                Ok(next) => entry.state = next,
                Err(err) => tracing::debug!("{}: {}", worker_id, err),
            }
        }
    }

    fn stats(&self) -> PoolStats {
        let workers: Vec<WorkerStats> = self
            .workers
            .values()
            .map(|w| WorkerStats {
                state: w.state,
                snapshot: w.report.snapshot(),
            })
            .collect();
        PoolStats {
            active_workers: self.active(),
            pending: self.queue.len(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
            jobs_processed: self.exited_jobs
                + workers.iter().map(|w| w.snapshot.jobs_processed).sum::<u64>(),
            errors: self.exited_errors + workers.iter().map(|w| w.snapshot.errors).sum::<u64>(),
            workers,
        }
    }

    fn reply_if_drained(&mut self) {
        if self.draining && self.workers.is_empty() {
            for reply in self.drain_waiters.drain(..) {
                let _ = reply.send(());
            }
        }
    }
}

/// Supervisor actor arguments.
pub(crate) struct SupervisorArgs {
    pub config: PoolConfig,
    pub queue: Arc<PriorityQueue<WorkItem>>,
    pub gate: Option<Arc<RateGate>>,
    pub handler: Arc<dyn JobHandler>,
    pub token: CancellationToken,
    pub event_tx: broadcast::Sender<PoolEvent>,
    pub gauges: Arc<PoolGauges>,
}

async fn spawn_worker(
    myself: &ActorRef<PoolMessage>,
    state: &mut SupervisorState,
) -> Result<WorkerId, PipelineError> {
    let worker_id = state.next_worker_id();
    let retire = state.token.child();
    let report = Arc::new(WorkerReport::new(worker_id));
    let args = WorkerArgs {
        worker_id,
        queue: state.queue.clone(),
        gate: state.gate.clone(),
        handler: state.handler.clone(),
        pool: myself.clone(),
        retire: retire.clone(),
        jobs: state.token.clone(),
        event_tx: state.event_tx.clone(),
        report: report.clone(),
    };

    let (actor, _handle) = Actor::spawn_linked(None, WorkerActor, args, myself.get_cell())
        .await
        .map_err(|e| PipelineError::Spawn(format!("Failed to spawn {}: {}", worker_id, e)))?;

    state.workers.insert(
        worker_id,
        WorkerEntry {
            state: WorkerState::Idle,
            retire,
            actor,
            report,
        },
    );
    state.emit(PoolEvent::WorkerStarted {
        worker_id,
        timestamp: Utc::now(),
    });
    state.publish();
    Ok(worker_id)
}

/// Drop a worker from the roster and fold its counters into the pool totals.
///
/// Called from both the exit message and the supervision event, whichever
/// arrives first. The second call finds no entry.
fn forget_worker(state: &mut SupervisorState, worker_id: WorkerId) {
    let Some(entry) = state.workers.remove(&worker_id) else {
        return;
    };
    let snapshot = entry.report.snapshot();
    state.exited_jobs += snapshot.jobs_processed;
    state.exited_errors += snapshot.errors;
    state.emit(PoolEvent::WorkerSnapshot {
        snapshot,
        timestamp: Utc::now(),
    });
    state.emit(PoolEvent::WorkerExited {
        worker_id,
        timestamp: Utc::now(),
    });
    state.publish();
}

/// Respawn workers until the pool is back at its floor.
async fn restore_floor(myself: &ActorRef<PoolMessage>, state: &mut SupervisorState) {
    while !state.draining
        && !state.queue.is_closed()
        && !state.token.is_cancelled()
        && state.active() < state.config.min_workers
    {
        match spawn_worker(myself, state).await {
            Ok(worker_id) => tracing::info!("Replaced lost worker with {}", worker_id),
            Err(e) => {
                tracing::error!("Could not restore worker floor: {}", e);
                break;
            }
        }
    }
}

async fn scale(myself: &ActorRef<PoolMessage>, state: &mut SupervisorState) {
    let pending = state.queue.len();
    let active = state.active();

    match scaling::decide(pending, active, &state.config) {
        ScaleDecision::Grow => match spawn_worker(myself, state).await {
            Ok(worker_id) => {
                tracing::debug!(
                    "Scaled up to {} workers ({} pending), added {}",
                    active + 1,
                    pending,
                    worker_id
                );
                state.emit(PoolEvent::Scaled {
                    from: active,
                    to: active + 1,
                    pending,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => tracing::warn!("Scale up failed: {}", e),
        },
        ScaleDecision::Shrink => {
            let roster: BTreeMap<WorkerId, WorkerState> =
                state.workers.iter().map(|(id, w)| (*id, w.state)).collect();
            let Some(worker_id) = scaling::pick_retiree(&roster) else {
                return;
            };
            state.transition(worker_id, WorkerEvent::Retire);
            if let Some(entry) = state.workers.get(&worker_id) {
                entry.retire.cancel();
            }
            tracing::debug!(
                "Scaled down to {} workers ({} pending), retiring {}",
                active - 1,
                pending,
                worker_id
            );
            state.emit(PoolEvent::WorkerRetired {
                worker_id,
                timestamp: Utc::now(),
            });
            state.emit(PoolEvent::Scaled {
                from: active,
                to: active - 1,
                pending,
                timestamp: Utc::now(),
            });
            state.publish();
        }
        ScaleDecision::Hold => {}
    }
}

/// Supervisor actor that manages the workers of one pool.
pub(crate) struct PoolSupervisor;

impl Actor for PoolSupervisor {
    type Msg = PoolMessage;
    type State = SupervisorState;
    type Arguments = SupervisorArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting worker pool supervisor ({}..={} workers)",
            args.config.min_workers,
            args.config.max_workers
        );

        let mut state = SupervisorState {
            config: args.config,
            queue: args.queue,
            gate: args.gate,
            handler: args.handler,
            token: args.token,
            event_tx: args.event_tx,
            gauges: args.gauges,
            workers: BTreeMap::new(),
            worker_counter: 0,
            draining: false,
            drain_waiters: Vec::new(),
            exited_jobs: 0,
            exited_errors: 0,
        };

        for _ in 0..state.config.min_workers {
            spawn_worker(&myself, &mut state).await?;
        }

        // Start periodic tick
        let myself_clone = myself.clone();
        let period = state.config.scale_check_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if myself_clone.send_message(PoolMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::Tick => {
                if !state.draining && !state.queue.is_closed() && !state.token.is_cancelled() {
                    scale(&myself, state).await;
                }
            }

            PoolMessage::WorkerBusy { worker_id } => {
                state.transition(worker_id, WorkerEvent::Dequeued);
            }

            PoolMessage::WorkerIdle { worker_id } => {
                state.transition(worker_id, WorkerEvent::Finished);
            }

            PoolMessage::WorkerExited { worker_id } => {
                tracing::debug!("{} exited", worker_id);
                state.transition(worker_id, WorkerEvent::Exit);
                forget_worker(state, worker_id);
                restore_floor(&myself, state).await;
                state.reply_if_drained();
            }

            PoolMessage::GetStats { reply } => {
                let _ = reply.send(state.stats());
            }

            PoolMessage::AwaitDrained { reply } => {
                state.draining = true;
                state.drain_waiters.push(reply);
                state.reply_if_drained();
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let (cell, failure) = match message {
            SupervisionEvent::ActorFailed(cell, err) => (cell, Some(err.to_string())),
            SupervisionEvent::ActorTerminated(cell, _, _) => (cell, None),
            _ => return Ok(()),
        };

        let worker = state
            .workers
            .iter()
            .find(|(_, w)| w.actor.get_id() == cell.get_id())
            .map(|(id, w)| (*id, w.report.has_exited()));
        let Some((worker_id, reported_exit)) = worker else {
            return Ok(());
        };

        match failure {
            Some(err) => tracing::warn!("{} failed: {}", worker_id, err),
            None if reported_exit => tracing::debug!("{} stopped", worker_id),
            None => tracing::warn!("{} terminated without reporting its exit", worker_id),
        }
        state.transition(worker_id, WorkerEvent::Exit);
        forget_worker(state, worker_id);
        restore_floor(&myself, state).await;
        state.reply_if_drained();
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!("Worker pool supervisor stopped");
        state.gauges.active.store(0, Ordering::Release);
        Ok(())
    }
}
