//! Fan-out -> worker pools -> fan-in composition.

use pipeline_core::{PipelineError, PipelineResult};

use crate::cancel::CancellationToken;
use crate::fan_in::{FanInAggregator, MergedStream};
use crate::fan_out::{FanOutRouter, JobStream};
use crate::pool::WorkerPool;

/// Routes an input stream across one worker pool per lane and merges the results.
#[derive(Debug, Clone)]
pub struct Pipeline {
    router: FanOutRouter,
    lanes: Vec<WorkerPool>,
    aggregator: FanInAggregator,
}

impl Pipeline {
    pub fn new(router: FanOutRouter, lanes: Vec<WorkerPool>) -> Self {
        Self {
            router,
            lanes,
            aggregator: FanInAggregator::default(),
        }
    }

    pub fn with_aggregator(mut self, aggregator: FanInAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn lanes(&self) -> &[WorkerPool] {
        &self.lanes
    }

    /// Start processing `input`.
    ///
    /// Cancelling `token` stops routing, cancels every job submitted through the
    /// pipeline, and ends the merged stream after already completed results.
    pub fn run(&self, input: JobStream, token: &CancellationToken) -> PipelineResult<MergedStream> {
        if self.lanes.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "pipeline needs at least one worker pool".to_string(),
            ));
        }
        tracing::debug!("Starting pipeline over {} lanes", self.lanes.len());

        let routed = self.router.route(input, self.lanes.len(), token.child())?;
        let results = routed
            .into_iter()
            .zip(&self.lanes)
            .map(|(lane, pool)| pool.process_lane(lane, token.child()))
            .collect();
        Ok(self.aggregator.merge(results, token.child()))
    }

    /// Close every lane's pool gracefully.
    pub async fn close(&self) -> PipelineResult<()> {
        let mut first_error = None;
        for pool in &self.lanes {
            if let Err(err) = pool.close().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
