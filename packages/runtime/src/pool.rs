//! Worker pool handle: submission, result handles and shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use pipeline_core::{
    Job, JobError, JobId, JobResult, OverflowPolicy, PipelineError, PipelineResult, PoolConfig,
    PoolEvent, Priority, WorkerId,
};
use ractor::{Actor, ActorRef};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::batch::{Batch, BatchAccumulator};
use crate::cancel::CancellationToken;
use crate::handler::JobHandler;
use crate::messages::{PoolMessage, PoolStats};
use crate::priority_queue::{Prioritized, PriorityQueue};
use crate::rate_gate::RateGate;
use crate::supervisor::{PoolGauges, PoolSupervisor, SupervisorArgs};

/// A submitted job and the channel its result goes back on.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub job: Job,
    /// Submitter's token; the job runs under a child of it.
    pub token: CancellationToken,
    pub reply: oneshot::Sender<JobResult>,
}

/// Unit of work a worker dequeues.
#[derive(Debug)]
pub(crate) enum WorkItem {
    Single(Envelope),
    Batch(Batch<Envelope>),
}

impl Prioritized for WorkItem {
    fn priority(&self) -> Priority {
        match self {
            WorkItem::Single(envelope) => envelope.job.priority,
            WorkItem::Batch(batch) => batch
                .items
                .iter()
                .map(|envelope| envelope.job.priority)
                .max()
                .unwrap_or_default(),
        }
    }
}

/// Resolves to the result of one submitted job.
///
/// Resolves to `Err(Cancelled)` if the job was discarded before it ran.
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the result, giving up when `token` fires.
    pub async fn wait(self, token: &CancellationToken) -> PipelineResult<JobResult> {
        token.run_until_cancelled(self).await?
    }
}

impl Future for JobHandle {
    type Output = PipelineResult<JobResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.map_err(|_| PipelineError::Cancelled))
    }
}

struct PoolShared {
    config: PoolConfig,
    queue: Arc<PriorityQueue<WorkItem>>,
    batcher: Option<BatchAccumulator<Envelope>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    supervisor: ActorRef<PoolMessage>,
    supervisor_handle: Mutex<Option<JoinHandle<()>>>,
    token: CancellationToken,
    gauges: Arc<PoolGauges>,
    closing: AtomicBool,
    event_tx: broadcast::Sender<PoolEvent>,
}

/// An elastic pool of workers processing jobs from a shared priority queue.
///
/// The pool is a cheap handle; clones share the same workers.
///
/// # Example
///
/// ```ignore
/// let handler = job_handler!("echo", |job, _token| Ok(Some(job.payload)));
/// let pool = WorkerPool::start(PoolConfig::default(), Arc::new(handler)).await?;
/// let handle = pool.submit(Job::new("echo", json!(1))).await?;
/// let result = handle.await?;
/// pool.close().await?;
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Start a pool with `min_workers` workers.
    pub async fn start(config: PoolConfig, handler: Arc<dyn JobHandler>) -> PipelineResult<Self> {
        config.validate()?;

        let token = CancellationToken::new();
        let queue = Arc::new(PriorityQueue::new(
            config.queue_capacity,
            config.overflow,
            config.starvation_ceiling,
        ));
        let gate = match config.rate_limit_per_second {
            Some(rate) => Some(Arc::new(RateGate::new(rate, config.rate_limit_burst)?)),
            None => None,
        };
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let gauges = Arc::new(PoolGauges::default());

        let args = SupervisorArgs {
            config: config.clone(),
            queue: queue.clone(),
            gate,
            handler,
            token: token.clone(),
            event_tx: event_tx.clone(),
            gauges: gauges.clone(),
        };
        let (supervisor, supervisor_handle) = Actor::spawn(None, PoolSupervisor, args)
            .await
            .map_err(|e| PipelineError::Spawn(e.to_string()))?;

        let (batcher, forwarder) = match config.batch_max_size {
            Some(max_size) => {
                let (batcher, batches) =
                    BatchAccumulator::spawn(max_size, config.batch_max_wait(), token.clone());
                let forwarder =
                    tokio::spawn(forward_batches(batches, queue.clone(), token.clone()));
                (Some(batcher), Some(forwarder))
            }
            None => (None, None),
        };

        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                queue,
                batcher,
                forwarder: Mutex::new(forwarder),
                supervisor,
                supervisor_handle: Mutex::new(Some(supervisor_handle)),
                token,
                gauges,
                closing: AtomicBool::new(false),
                event_tx,
            }),
        })
    }

    /// Submit a job under the pool's own token.
    pub async fn submit(&self, job: Job) -> PipelineResult<JobHandle> {
        let token = self.shared.token.clone();
        self.submit_with(job, &token).await
    }

    /// Submit a job under `token`.
    ///
    /// `token` bounds any backpressure wait, and the job runs under a token
    /// that fires when either `token` or the pool's token does.
    ///
    /// Fails with `QueueFull` under the reject policy, `PoolClosed` once
    /// shutdown has begun, and `Spawn` if the pool has no live workers.
    pub async fn submit_with(
        &self,
        job: Job,
        token: &CancellationToken,
    ) -> PipelineResult<JobHandle> {
        let shared = &self.shared;
        if shared.closing.load(Ordering::Acquire) {
            return Err(PipelineError::PoolClosed);
        }
        if let Some(reason) = shared.token.err() {
            return Err(reason.into());
        }
        if shared.gauges.live() == 0 {
            return Err(PipelineError::Spawn("pool has no live workers".to_string()));
        }

        let (reply, rx) = oneshot::channel();
        let handle = JobHandle { job_id: job.id, rx };
        let envelope = Envelope {
            job,
            token: token.clone(),
            reply,
        };

        match &shared.batcher {
            Some(batcher) => batcher.add(envelope, token).await.map_err(|err| match err {
                PipelineError::QueueClosed => PipelineError::PoolClosed,
                other => other,
            })?,
            None => shared.queue.enqueue(WorkItem::Single(envelope), token).await?,
        }
        Ok(handle)
    }

    /// Flush a partially filled batch without waiting for its timer.
    pub async fn flush(&self) -> PipelineResult<()> {
        match &self.shared.batcher {
            Some(batcher) => batcher.flush(&self.shared.token).await,
            None => Ok(()),
        }
    }

    /// Feed one lane of jobs through the pool.
    ///
    /// Results are emitted in completion order. An error on the input or a
    /// discarded job ends the lane with that error after in-flight results have
    /// been delivered. Once a submission fails, that job and every job still
    /// arriving on the input come back as failed results, so each input job
    /// yields exactly one result before the lane reports the error.
    pub fn process_lane(
        &self,
        mut input: mpsc::Receiver<PipelineResult<Job>>,
        token: CancellationToken,
    ) -> mpsc::Receiver<PipelineResult<JobResult>> {
        let (tx, rx) = mpsc::channel(self.shared.config.max_workers * 2);
        let pool = self.clone();

        tokio::spawn(async move {
            let mut in_flight = FuturesUnordered::new();
            let mut accepting = true;
            let mut terminal: Option<PipelineError> = None;
            let mut refused: Option<PipelineError> = None;

            loop {
                tokio::select! {
                    Some(result) = in_flight.next(), if !in_flight.is_empty() => match result {
                        Ok(result) => {
                            if tx.send(Ok(result)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            terminal.get_or_insert(err);
                        }
                    },
                    message = input.recv(), if accepting => match message {
                        Some(Ok(job)) => {
                            let job_id = job.id;
                            let submitted = match &refused {
                                Some(err) => Err(err.clone()),
                                None => pool.submit_with(job, &token).await,
                            };
                            match submitted {
                                Ok(handle) => in_flight.push(handle),
                                Err(err) => {
                                    if refused.is_none() {
                                        tracing::warn!("Lane submission failed: {}", err);
                                    }
                                    if tx.send(Ok(unsubmitted(job_id, &err))).await.is_err() {
                                        return;
                                    }
                                    refused.get_or_insert(err);
                                }
                            }
                        }
                        Some(Err(err)) => {
                            terminal = Some(err);
                            accepting = false;
                        }
                        None => accepting = false,
                    },
                    else => break,
                }
            }

            if let Some(err) = refused.or(terminal) {
                let _ = tx.send(Err(err)).await;
            }
        });

        rx
    }

    /// Workers that are idle or processing. Retiring workers are not counted.
    pub fn active_workers(&self) -> usize {
        self.shared.gauges.active()
    }

    /// Items waiting in the queue.
    pub fn pending_jobs(&self) -> usize {
        self.shared.queue.len()
    }

    /// Per-worker counters and pool totals.
    pub async fn stats(&self) -> PipelineResult<PoolStats> {
        let (tx, rx) = ractor::concurrency::oneshot();
        self.shared
            .supervisor
            .send_message(PoolMessage::GetStats { reply: tx.into() })
            .map_err(|_| PipelineError::PoolClosed)?;
        rx.await.map_err(|_| PipelineError::PoolClosed)
    }

    /// Subscribe to pool events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.event_tx.subscribe()
    }

    /// The pool's root token. Cancelling it is equivalent to `close_now`
    /// without waiting for workers.
    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Graceful shutdown.
    ///
    /// Stops intake, lets workers drain the queue, and waits up to the grace
    /// period. If the drain does not finish in time, in-flight jobs are
    /// cancelled as with [`close_now`](Self::close_now).
    pub async fn close(&self) -> PipelineResult<()> {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return self.wait_drained(None).await;
        }
        tracing::info!("Closing worker pool");

        if let Some(batcher) = &self.shared.batcher {
            batcher.close().await;
        }
        self.join_forwarder().await;
        self.shared.queue.close();

        let grace = self.shared.config.shutdown_grace_period();
        if self.wait_drained(Some(grace)).await.is_err() {
            tracing::warn!(
                "Worker pool did not drain within {:?}, cancelling in-flight jobs",
                grace
            );
            self.abort();
            let _ = self.wait_drained(Some(grace)).await;
        }
        self.stop_supervisor().await;
        Ok(())
    }

    /// Immediate shutdown.
    ///
    /// Cancels every in-flight job's token and discards queued jobs, whose
    /// handles resolve to `Err(Cancelled)`.
    pub async fn close_now(&self) -> PipelineResult<()> {
        self.shared.closing.store(true, Ordering::Release);
        tracing::info!("Closing worker pool immediately");

        self.abort();
        self.join_forwarder().await;

        let grace = self.shared.config.shutdown_grace_period();
        if self.wait_drained(Some(grace)).await.is_err() {
            tracing::warn!("Workers still running after {:?}; leaving them detached", grace);
        }
        self.stop_supervisor().await;
        Ok(())
    }

    fn abort(&self) {
        self.shared.token.cancel();
        self.shared.queue.close();
        let discarded = self.shared.queue.drain();
        if !discarded.is_empty() {
            tracing::debug!("Discarded {} queued items", discarded.len());
        }
    }

    async fn join_forwarder(&self) {
        let forwarder = self
            .shared
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
    }

    /// Ask the supervisor to stop scaling and wait until every worker has exited.
    async fn wait_drained(&self, limit: Option<Duration>) -> PipelineResult<()> {
        let (tx, rx) = ractor::concurrency::oneshot();
        if self
            .shared
            .supervisor
            .send_message(PoolMessage::AwaitDrained { reply: tx.into() })
            .is_err()
        {
            // Supervisor already stopped.
            return Ok(());
        }
        match limit {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(_) => Ok(()),
                Err(_) => Err(PipelineError::DeadlineExceeded),
            },
            None => {
                let _ = rx.await;
                Ok(())
            }
        }
    }

    async fn stop_supervisor(&self) {
        self.shared.supervisor.stop(None);
        let handle = self
            .shared
            .supervisor_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active_workers", &self.active_workers())
            .field("pending_jobs", &self.pending_jobs())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Move flushed batches onto the queue. Batches always wait for space.
async fn forward_batches(
    mut batches: mpsc::Receiver<Batch<Envelope>>,
    queue: Arc<PriorityQueue<WorkItem>>,
    token: CancellationToken,
) {
    while let Some(batch) = batches.recv().await {
        let size = batch.len();
        if let Err(err) = queue
            .enqueue_with(WorkItem::Batch(batch), &token, OverflowPolicy::Block)
            .await
        {
            tracing::warn!("Dropped batch of {} jobs: {}", size, err);
        }
    }
}

/// Result reported for a job the pool would not take.
fn unsubmitted(job_id: JobId, err: &PipelineError) -> JobResult {
    let error = match err {
        PipelineError::Cancelled => JobError::Cancelled,
        other => JobError::Failed(other.to_string()),
    };
    JobResult::failure(job_id, WorkerId::default(), error, Duration::ZERO)
}
