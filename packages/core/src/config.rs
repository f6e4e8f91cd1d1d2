//! Configuration for worker pools and their queue, rate gate and batching.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// What `enqueue` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space, bounded by the caller's cancellation token.
    #[default]
    Block,
    /// Fail immediately with `QueueFull`.
    Reject,
}

/// Configuration for pool behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on live workers.
    pub max_workers: usize,
    /// Lower bound on live workers while the pool is running.
    pub min_workers: usize,
    /// How often the scaling controller samples load (milliseconds).
    pub scale_check_interval_ms: u64,
    /// Grow when pending/active exceeds this ratio.
    pub high_water_ratio: f64,
    /// Shrink when pending/active falls below this ratio.
    pub low_water_ratio: f64,
    /// Rate limit: max job starts per second across the pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_second: Option<f64>,
    /// Token bucket capacity for the rate limit.
    pub rate_limit_burst: u32,
    /// Batch size; batching is disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_max_size: Option<usize>,
    /// Longest a partial batch waits before being flushed (milliseconds).
    pub batch_max_wait_ms: u64,
    /// Maximum number of queued jobs; unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    /// Backpressure behavior when the queue is full.
    pub overflow: OverflowPolicy,
    /// Max consecutive high priority dequeues while low priority work waits.
    pub starvation_ceiling: u32,
    /// How long `close` waits for a drain before cancelling in-flight work (milliseconds).
    pub shutdown_grace_period_ms: u64,
    /// Buffer size of the pool event broadcast channel.
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            min_workers: 1,
            scale_check_interval_ms: 250,
            high_water_ratio: 5.0,
            low_water_ratio: 1.0,
            rate_limit_per_second: None,
            rate_limit_burst: 1,
            batch_max_size: None,
            batch_max_wait_ms: 100,
            queue_capacity: None,
            overflow: OverflowPolicy::Block,
            starvation_ceiling: 4,
            shutdown_grace_period_ms: 30_000,
            event_capacity: 1024,
        }
    }
}

impl PoolConfig {
    /// Set the worker bounds.
    pub fn with_workers(mut self, min_workers: usize, max_workers: usize) -> Self {
        self.min_workers = min_workers;
        self.max_workers = max_workers;
        self
    }

    /// Set the scaling interval and water marks.
    pub fn with_scaling(mut self, interval: Duration, low_water: f64, high_water: f64) -> Self {
        self.scale_check_interval_ms = interval.as_millis() as u64;
        self.low_water_ratio = low_water;
        self.high_water_ratio = high_water;
        self
    }

    /// Enable the token bucket rate limit.
    pub fn with_rate_limit(mut self, per_second: f64, burst: u32) -> Self {
        self.rate_limit_per_second = Some(per_second);
        self.rate_limit_burst = burst;
        self
    }

    /// Enable batching.
    pub fn with_batching(mut self, max_size: usize, max_wait: Duration) -> Self {
        self.batch_max_size = Some(max_size);
        self.batch_max_wait_ms = max_wait.as_millis() as u64;
        self
    }

    /// Bound the queue.
    pub fn with_queue_capacity(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.queue_capacity = Some(capacity);
        self.overflow = overflow;
        self
    }

    /// Set the starvation ceiling K.
    pub fn with_starvation_ceiling(mut self, k: u32) -> Self {
        self.starvation_ceiling = k;
        self
    }

    /// Set the graceful shutdown window.
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn scale_check_interval(&self) -> Duration {
        Duration::from_millis(self.scale_check_interval_ms)
    }

    pub fn batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.batch_max_wait_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    /// Check the configuration for contradictory or degenerate values.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::InvalidConfig(msg.to_string()));

        if self.min_workers == 0 {
            return invalid("min_workers must be at least 1");
        }
        if self.min_workers > self.max_workers {
            return invalid("min_workers must not exceed max_workers");
        }
        if self.scale_check_interval_ms == 0 {
            return invalid("scale_check_interval_ms must be positive");
        }
        if !(self.low_water_ratio < self.high_water_ratio) {
            return invalid("low_water_ratio must be below high_water_ratio");
        }
        if let Some(rate) = self.rate_limit_per_second
            && !(rate > 0.0 && rate.is_finite())
        {
            return invalid("rate_limit_per_second must be a positive number");
        }
        if self.rate_limit_burst == 0 {
            return invalid("rate_limit_burst must be at least 1");
        }
        if self.batch_max_size == Some(0) {
            return invalid("batch_max_size must be at least 1");
        }
        if self.batch_max_size.is_some() && self.batch_max_wait_ms == 0 {
            return invalid("batch_max_wait_ms must be positive when batching");
        }
        if self.queue_capacity == Some(0) {
            return invalid("queue_capacity must be at least 1");
        }
        if self.starvation_ceiling == 0 {
            return invalid("starvation_ceiling must be at least 1");
        }
        if self.event_capacity == 0 {
            return invalid("event_capacity must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(PoolConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let config = PoolConfig::default().with_workers(5, 2);
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_inverted_water_marks() {
        let config = PoolConfig::default().with_scaling(Duration::from_millis(10), 5.0, 1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_starvation_ceiling() {
        let config = PoolConfig::default().with_starvation_ceiling(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() -> Result<(), serde_json::Error> {
        let config: PoolConfig =
            serde_json::from_str(r#"{"max_workers": 8, "overflow": "reject"}"#)?;
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.overflow, OverflowPolicy::Reject);
        assert_eq!(config.batch_max_size, None);
        Ok(())
    }
}
