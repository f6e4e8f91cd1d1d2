//! Fan-out routing of one job stream onto N lanes.

use std::sync::Arc;

use futures_util::future::join_all;
use pipeline_core::{Job, PipelineError, PipelineResult};
use tokio::sync::mpsc;

use crate::cancel::CancellationToken;

/// Input or output lane of jobs. An `Err` item is a terminal signal.
pub type JobStream = mpsc::Receiver<PipelineResult<Job>>;

/// Key function for affinity routing.
pub type KeyFn = Arc<dyn Fn(&Job) -> u64 + Send + Sync>;

/// How the router picks a lane for each job.
#[derive(Clone)]
pub enum RoutingStrategy {
    /// Lanes take turns.
    RoundRobin,
    /// Jobs with the same key go to the same lane.
    KeyAffinity(KeyFn),
    /// The lane with the most free buffer space wins; ties rotate.
    LeastLoaded,
}

impl std::fmt::Debug for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingStrategy::RoundRobin => write!(f, "RoundRobin"),
            RoutingStrategy::KeyAffinity(_) => write!(f, "KeyAffinity"),
            RoutingStrategy::LeastLoaded => write!(f, "LeastLoaded"),
        }
    }
}

/// Distributes every job of an input stream to exactly one lane.
#[derive(Debug, Clone)]
pub struct FanOutRouter {
    strategy: RoutingStrategy,
    lane_capacity: usize,
}

impl Default for FanOutRouter {
    fn default() -> Self {
        Self::round_robin()
    }
}

impl FanOutRouter {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            lane_capacity: 16,
        }
    }

    pub fn round_robin() -> Self {
        Self::new(RoutingStrategy::RoundRobin)
    }

    /// Route by `key(job) % lanes`.
    pub fn by_key(key: impl Fn(&Job) -> u64 + Send + Sync + 'static) -> Self {
        Self::new(RoutingStrategy::KeyAffinity(Arc::new(key)))
    }

    pub fn least_loaded() -> Self {
        Self::new(RoutingStrategy::LeastLoaded)
    }

    /// Set the buffer size of each output lane.
    pub fn with_lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_capacity = capacity.max(1);
        self
    }

    pub fn strategy(&self) -> &RoutingStrategy {
        &self.strategy
    }

    /// Split `input` into `lanes` streams.
    ///
    /// A job is never duplicated or dropped while at least one lane is still
    /// being consumed. An error on the input is forwarded to every lane and ends
    /// routing. If `token` fires, every lane receives the cancellation reason.
    pub fn route(
        &self,
        input: JobStream,
        lanes: usize,
        token: CancellationToken,
    ) -> PipelineResult<Vec<JobStream>> {
        if lanes == 0 {
            return Err(PipelineError::InvalidConfig(
                "fan-out needs at least one lane".to_string(),
            ));
        }

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..lanes).map(|_| mpsc::channel(self.lane_capacity)).unzip();
        tokio::spawn(dispatch(self.strategy.clone(), input, senders, token));
        Ok(receivers)
    }
}

struct Lanes {
    senders: Vec<Option<mpsc::Sender<PipelineResult<Job>>>>,
    cursor: usize,
}

impl Lanes {
    fn open(&self) -> usize {
        self.senders.iter().filter(|s| s.is_some()).count()
    }

    /// First open lane at or after `start`, wrapping around.
    fn next_open(&self, start: usize) -> Option<usize> {
        let n = self.senders.len();
        (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&lane| self.senders[lane].is_some())
    }

    fn pick(&mut self, strategy: &RoutingStrategy, job: &Job) -> Option<usize> {
        let n = self.senders.len();
        match strategy {
            RoutingStrategy::RoundRobin => {
                let lane = self.next_open(self.cursor)?;
                self.cursor = (lane + 1) % n;
                Some(lane)
            }
            RoutingStrategy::KeyAffinity(key) => self.next_open((key(job) % n as u64) as usize),
            RoutingStrategy::LeastLoaded => {
                let start = self.cursor;
                self.cursor = (self.cursor + 1) % n;
                (0..n)
                    .map(|offset| (start + offset) % n)
                    .filter_map(|lane| {
                        self.senders[lane]
                            .as_ref()
                            .map(|sender| (lane, sender.capacity()))
                    })
                    // max_by_key keeps the last maximum; reverse so the rotation start wins ties.
                    .rev()
                    .max_by_key(|(_, free)| *free)
                    .map(|(lane, _)| lane)
            }
        }
    }

    /// Deliver a terminal error on every open lane, then close them all.
    ///
    /// Each send waits for room in its lane and gives up only once that lane's
    /// receiver is gone. A lane closes as soon as its own signal is delivered.
    async fn terminate(&mut self, err: PipelineError) {
        let pending = self.senders.iter_mut().filter_map(Option::take).map(|sender| {
            let err = err.clone();
            async move {
                let _ = sender.send(Err(err)).await;
            }
        });
        join_all(pending).await;
    }
}

async fn dispatch(
    strategy: RoutingStrategy,
    mut input: JobStream,
    senders: Vec<mpsc::Sender<PipelineResult<Job>>>,
    token: CancellationToken,
) {
    let mut lanes = Lanes {
        senders: senders.into_iter().map(Some).collect(),
        cursor: 0,
    };
    let mut routed = 0u64;

    loop {
        let message = tokio::select! {
            biased;
            reason = token.cancelled() => {
                tracing::debug!("Fan-out cancelled after {} jobs", routed);
                lanes.terminate(reason.into()).await;
                return;
            }
            message = input.recv() => message,
        };

        let mut job = match message {
            Some(Ok(job)) => job,
            Some(Err(err)) => {
                tracing::warn!("Fan-out input failed: {}", err);
                for sender in lanes.senders.iter().flatten() {
                    let _ = token.run_until_cancelled(sender.send(Err(err.clone()))).await;
                }
                return;
            }
            None => {
                tracing::debug!("Fan-out input complete after {} jobs", routed);
                return;
            }
        };

        // Retry on another lane if the chosen one has been dropped.
        loop {
            let Some(lane) = lanes.pick(&strategy, &job) else {
                tracing::warn!("Fan-out has no open lanes, stopping");
                return;
            };
            let Some(sender) = lanes.senders[lane].as_ref() else {
                continue;
            };
            let sent = token.run_until_cancelled(sender.send(Ok(job))).await;
            match sent {
                Ok(Ok(())) => {
                    routed += 1;
                    break;
                }
                Ok(Err(mpsc::error::SendError(returned))) => {
                    tracing::warn!("Fan-out lane {} closed, {} lanes left", lane, lanes.open() - 1);
                    lanes.senders[lane] = None;
                    let Ok(returned) = returned else {
                        return;
                    };
                    job = returned;
                }
                Err(err) => {
                    lanes.terminate(err).await;
                    return;
                }
            }
        }
    }
}
