//! Fan-in: merge N result lanes into one stream in arrival order.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use pipeline_core::{JobResult, PipelineError, PipelineResult};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cancel::CancellationToken;

/// Lane of job results. An `Err` item is a terminal signal.
pub type ResultStream = mpsc::Receiver<PipelineResult<JobResult>>;

/// How a lane ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum LaneOutcome {
    /// The lane closed normally.
    Completed,
    /// The lane reported a fatal error.
    Failed(String),
    /// The merge was cancelled before the lane finished.
    Cancelled,
}

/// Per-lane completion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaneSummary {
    pub lane: usize,
    /// Results forwarded to the merged stream.
    pub forwarded: u64,
    /// `None` while the lane is still running.
    pub outcome: Option<LaneOutcome>,
}

/// Merges result lanes.
#[derive(Debug, Clone)]
pub struct FanInAggregator {
    buffer: usize,
}

impl Default for FanInAggregator {
    fn default() -> Self {
        Self { buffer: 64 }
    }
}

impl FanInAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the merged stream's buffer size.
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }

    /// Merge `lanes` into one stream.
    ///
    /// Results are emitted as soon as any lane yields one. The stream ends after
    /// every lane has ended. A lane error marks the merge failed, but results
    /// from other lanes (and those the failed lane produced before its error)
    /// are still delivered. When `token` fires, results already buffered in the
    /// lanes are flushed and the stream ends.
    pub fn merge(&self, lanes: Vec<ResultStream>, token: CancellationToken) -> MergedStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let summary = Arc::new(Mutex::new(
            (0..lanes.len())
                .map(|lane| LaneSummary {
                    lane,
                    forwarded: 0,
                    outcome: None,
                })
                .collect::<Vec<_>>(),
        ));

        for (lane, input) in lanes.into_iter().enumerate() {
            tokio::spawn(forward_lane(
                lane,
                input,
                tx.clone(),
                summary.clone(),
                token.clone(),
            ));
        }

        MergedStream { rx, summary }
    }
}

fn lock(summary: &Mutex<Vec<LaneSummary>>) -> MutexGuard<'_, Vec<LaneSummary>> {
    summary.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn forward_lane(
    lane: usize,
    mut input: ResultStream,
    output: mpsc::Sender<JobResult>,
    summary: Arc<Mutex<Vec<LaneSummary>>>,
    token: CancellationToken,
) {
    let forward = |result: JobResult| {
        let output = output.clone();
        let summary = summary.clone();
        async move {
            let sent = output.send(result).await.is_ok();
            if sent {
                lock(&summary)[lane].forwarded += 1;
            }
            sent
        }
    };

    let outcome = loop {
        tokio::select! {
            biased;
            message = input.recv() => match message {
                Some(Ok(result)) => {
                    if !forward(result).await {
                        break LaneOutcome::Completed;
                    }
                }
                Some(Err(err)) => {
                    tracing::warn!("Fan-in lane {} failed: {}", lane, err);
                    break if err.is_cancellation() {
                        LaneOutcome::Cancelled
                    } else {
                        LaneOutcome::Failed(err.to_string())
                    };
                }
                None => break LaneOutcome::Completed,
            },
            _ = token.cancelled() => {
                // Flush what the lane already produced.
                let mut flushed = 0;
                while let Ok(Ok(result)) = input.try_recv() {
                    if !forward(result).await {
                        break;
                    }
                    flushed += 1;
                }
                tracing::debug!(
                    "Fan-in lane {} cancelled, flushed {} buffered results",
                    lane,
                    flushed
                );
                break LaneOutcome::Cancelled;
            }
        }
    };

    lock(&summary)[lane].outcome = Some(outcome);
}

/// Output of [`FanInAggregator::merge`].
#[derive(Debug)]
pub struct MergedStream {
    rx: mpsc::Receiver<JobResult>,
    summary: Arc<Mutex<Vec<LaneSummary>>>,
}

impl MergedStream {
    /// Next result, or `None` once every lane has ended.
    pub async fn next(&mut self) -> Option<JobResult> {
        self.rx.recv().await
    }

    /// Per-lane progress so far.
    pub fn summary(&self) -> Vec<LaneSummary> {
        lock(&self.summary).clone()
    }

    /// True as soon as any lane has failed.
    pub fn is_failed(&self) -> bool {
        lock(&self.summary)
            .iter()
            .any(|lane| matches!(lane.outcome, Some(LaneOutcome::Failed(_))))
    }

    /// Overall status: the first failed lane, else `Cancelled` if any lane was
    /// cancelled, else `Ok`. Only final once the stream has ended.
    pub fn status(&self) -> PipelineResult<()> {
        let summary = lock(&self.summary);
        if let Some((lane, reason)) = summary.iter().find_map(|s| match &s.outcome {
            Some(LaneOutcome::Failed(reason)) => Some((s.lane, reason.clone())),
            _ => None,
        }) {
            return Err(PipelineError::LaneFailed { lane, reason });
        }
        if summary
            .iter()
            .any(|s| s.outcome == Some(LaneOutcome::Cancelled))
        {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Drain the stream, returning every result and the final status.
    pub async fn collect_all(mut self) -> (Vec<JobResult>, PipelineResult<()>) {
        let mut results = Vec::new();
        while let Some(result) = self.next().await {
            results.push(result);
        }
        let status = self.status();
        (results, status)
    }
}

impl Stream for MergedStream {
    type Item = JobResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
