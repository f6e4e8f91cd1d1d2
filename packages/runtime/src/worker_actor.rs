//! Worker actor for executing jobs.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use futures_util::FutureExt;
use pipeline_core::{Job, JobError, JobResult, PipelineError, PoolEvent, WorkerId, WorkerSnapshot};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;

use crate::batch::Batch;
use crate::cancel::CancellationToken;
use crate::handler::{HandlerResult, JobHandler};
use crate::messages::{PoolMessage, WorkerMessage};
use crate::pool::{Envelope, WorkItem};
use crate::priority_queue::PriorityQueue;
use crate::rate_gate::RateGate;

/// Counters a worker shares with its supervisor. They stay readable after the
/// worker has stopped, whichever way the supervisor learns about it.
#[derive(Debug)]
pub(crate) struct WorkerReport {
    snapshot: Mutex<WorkerSnapshot>,
    exited: AtomicBool,
}

impl WorkerReport {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            snapshot: Mutex::new(WorkerSnapshot::new(worker_id)),
            exited: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerSnapshot> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.lock().clone()
    }

    fn record(&self, busy: Duration, failed: bool) {
        self.lock().record(busy, failed);
    }

    /// Set by the worker just before it stops itself.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::Release);
    }
}

/// State for the worker actor.
pub(crate) struct WorkerActorState {
    pub worker_id: WorkerId,
    queue: Arc<PriorityQueue<WorkItem>>,
    gate: Option<Arc<RateGate>>,
    handler: Arc<dyn JobHandler>,
    pool: ActorRef<PoolMessage>,
    /// Fires when the supervisor retires this worker or the pool stops.
    retire: CancellationToken,
    /// Parent of every job token this worker hands out.
    jobs: CancellationToken,
    event_tx: broadcast::Sender<PoolEvent>,
    report: Arc<WorkerReport>,
}

impl WorkerActorState {
    fn emit(&self, event: PoolEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Worker actor arguments.
pub(crate) struct WorkerArgs {
    pub worker_id: WorkerId,
    pub queue: Arc<PriorityQueue<WorkItem>>,
    pub gate: Option<Arc<RateGate>>,
    pub handler: Arc<dyn JobHandler>,
    pub pool: ActorRef<PoolMessage>,
    pub retire: CancellationToken,
    pub jobs: CancellationToken,
    pub event_tx: broadcast::Sender<PoolEvent>,
    pub report: Arc<WorkerReport>,
}

/// Worker actor that pulls items from the pool queue until retired or drained.
pub(crate) struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            queue: args.queue,
            gate: args.gate,
            handler: args.handler,
            pool: args.pool,
            retire: args.retire,
            jobs: args.jobs,
            event_tx: args.event_tx,
            report: args.report,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        myself.send_message(WorkerMessage::Pull)?;
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Pull => {
                let item = match state.queue.dequeue(&state.retire).await {
                    Ok(Some(item)) => item,
                    Ok(None) => {
                        tracing::debug!("{}: queue closed and drained", state.worker_id);
                        return exit(&myself, state);
                    }
                    Err(reason) => {
                        tracing::debug!("{}: stopping ({})", state.worker_id, reason);
                        return exit(&myself, state);
                    }
                };

                let _ = state.pool.send_message(PoolMessage::WorkerBusy {
                    worker_id: state.worker_id,
                });

                match item {
                    WorkItem::Single(envelope) => process_single(state, envelope).await,
                    WorkItem::Batch(batch) => process_batch(state, batch).await,
                }

                let _ = state.pool.send_message(PoolMessage::WorkerIdle {
                    worker_id: state.worker_id,
                });
                state.emit(PoolEvent::WorkerSnapshot {
                    snapshot: state.report.snapshot(),
                    timestamp: Utc::now(),
                });

                if state.retire.is_cancelled() {
                    return exit(&myself, state);
                }
                myself.send_message(WorkerMessage::Pull)?;
            }
        }

        Ok(())
    }
}

fn exit(
    myself: &ActorRef<WorkerMessage>,
    state: &mut WorkerActorState,
) -> Result<(), ActorProcessingErr> {
    let snapshot = state.report.snapshot();
    tracing::info!(
        "Shutting down worker: {} ({} jobs, {} errors)",
        state.worker_id,
        snapshot.jobs_processed,
        snapshot.errors
    );
    state.report.mark_exited();
    let _ = state.pool.send_message(PoolMessage::WorkerExited {
        worker_id: state.worker_id,
    });
    myself.stop(None);
    Ok(())
}

/// Token a job runs under: a child of the submitter's token that also fires
/// with the pool, narrowed by the job's own timeout.
fn job_token(linked: &CancellationToken, job: &Job) -> CancellationToken {
    match job.timeout() {
        Some(timeout) => linked.with_timeout(timeout),
        None => linked.child(),
    }
}

/// Wait for the rate gate, returning the job error if `token` fires first.
async fn admit(gate: Option<&RateGate>, token: &CancellationToken) -> Result<(), JobError> {
    if let Some(reason) = token.err() {
        return Err(reason.into());
    }
    if let Some(gate) = gate {
        gate.acquire(token).await.map_err(|err| match err {
            PipelineError::DeadlineExceeded => JobError::DeadlineExceeded,
            _ => JobError::Cancelled,
        })?;
    }
    Ok(())
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Map a handler error onto the job error, preferring the token's reason.
fn handler_error(message: String, token: &CancellationToken) -> JobError {
    match token.err() {
        Some(reason) => reason.into(),
        None => JobError::Failed(message),
    }
}

/// Record the outcome and broadcast it.
fn finish(state: &mut WorkerActorState, result: JobResult) -> JobResult {
    state.report.record(result.duration, !result.is_ok());
    let event = match &result.error {
        None => PoolEvent::JobCompleted {
            job_id: result.job_id,
            worker_id: state.worker_id,
            duration_ms: result.duration.as_millis() as u64,
            timestamp: Utc::now(),
        },
        Some(error) => {
            if result.is_worker_fault() {
                tracing::warn!(
                    "{} recovered from fault in job {}: {}",
                    state.worker_id,
                    result.job_id,
                    error
                );
            } else {
                tracing::debug!("Job {} failed: {}", result.job_id, error);
            }
            PoolEvent::JobFailed {
                job_id: result.job_id,
                worker_id: state.worker_id,
                error: error.clone(),
                timestamp: Utc::now(),
            }
        }
    };
    state.emit(event);
    result
}

fn to_result(
    job: &Job,
    worker_id: WorkerId,
    outcome: HandlerResult,
    token: &CancellationToken,
    started: Instant,
) -> JobResult {
    let duration = started.elapsed();
    match outcome {
        Ok(value) => JobResult::success(job.id, worker_id, value, duration),
        Err(message) => {
            JobResult::failure(job.id, worker_id, handler_error(message, token), duration)
        }
    }
}

async fn process_single(state: &mut WorkerActorState, envelope: Envelope) {
    let Envelope { job, token, reply } = envelope;
    let result = run_job(state, &job, &token).await;
    let result = finish(state, result);
    let _ = reply.send(result);
}

async fn run_job(state: &WorkerActorState, job: &Job, submitter: &CancellationToken) -> JobResult {
    let (linked, _link) = submitter.linked(&state.jobs);
    if let Err(error) = admit(state.gate.as_deref(), &linked).await {
        return JobResult::failure(job.id, state.worker_id, error, Default::default());
    }

    let token = job_token(&linked, job);
    state.emit(PoolEvent::JobStarted {
        job_id: job.id,
        worker_id: state.worker_id,
        timestamp: Utc::now(),
    });

    let started = Instant::now();
    let handler = &state.handler;
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(job, &token))) {
        Ok(fut) => fut,
        Err(panic) => {
            let fault = JobError::WorkerFault(panic_message(panic));
            return JobResult::failure(job.id, state.worker_id, fault, started.elapsed());
        }
    };

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => to_result(job, state.worker_id, outcome, &token, started),
        Err(panic) => {
            let fault = JobError::WorkerFault(panic_message(panic));
            JobResult::failure(job.id, state.worker_id, fault, started.elapsed())
        }
    }
}

async fn process_batch(state: &mut WorkerActorState, batch: Batch<Envelope>) {
    let cycle = batch.cycle;
    let mut jobs = Vec::with_capacity(batch.len());
    let mut replies = Vec::with_capacity(batch.len());
    for Envelope { job, token, reply } in batch.items {
        // Members whose submitter gave up are answered without running.
        match token.err() {
            Some(reason) => {
                let result =
                    JobResult::failure(job.id, state.worker_id, reason.into(), Duration::ZERO);
                let result = finish(state, result);
                let _ = reply.send(result);
            }
            None => {
                jobs.push(job);
                replies.push(reply);
            }
        }
    }
    if jobs.is_empty() {
        return;
    }
    tracing::debug!("{} processing batch {} of {} jobs", state.worker_id, cycle, jobs.len());

    let results = run_batch(state, &jobs).await;
    for (result, reply) in results.into_iter().zip(replies) {
        let result = finish(state, result);
        let _ = reply.send(result);
    }
}

async fn run_batch(state: &WorkerActorState, jobs: &[Job]) -> Vec<JobResult> {
    let fail_all = |error: JobError, started: Option<Instant>| {
        let duration = started.map(|s| s.elapsed()).unwrap_or_default();
        jobs.iter()
            .map(|job| JobResult::failure(job.id, state.worker_id, error.clone(), duration))
            .collect::<Vec<_>>()
    };

    if let Err(error) = admit(state.gate.as_deref(), &state.jobs).await {
        return fail_all(error, None);
    }

    // A batch runs under the tightest timeout of its members.
    let token = match jobs.iter().filter_map(Job::timeout).min() {
        Some(timeout) => state.jobs.with_timeout(timeout),
        None => state.jobs.child(),
    };
    for job in jobs {
        state.emit(PoolEvent::JobStarted {
            job_id: job.id,
            worker_id: state.worker_id,
            timestamp: Utc::now(),
        });
    }

    let started = Instant::now();
    let handler = &state.handler;
    let built = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle_batch(jobs, &token)));
    let fut = match built {
        Ok(fut) => fut,
        Err(panic) => return fail_all(JobError::WorkerFault(panic_message(panic)), Some(started)),
    };

    let outcomes = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcomes) => outcomes,
        Err(panic) => return fail_all(JobError::WorkerFault(panic_message(panic)), Some(started)),
    };

    let returned = outcomes.len();
    let mut outcomes = outcomes.into_iter();
    jobs.iter()
        .map(|job| {
            let outcome = outcomes.next().unwrap_or_else(|| {
                Err(format!("batch handler returned {} results for {} jobs", returned, jobs.len()))
            });
            to_result(job, state.worker_id, outcome, &token, started)
        })
        .collect()
}
