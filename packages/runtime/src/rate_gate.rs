//! Token bucket rate limiter shared by every worker of a pool.

use std::time::Duration;

use pipeline_core::{PipelineError, PipelineResult};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::cancel::CancellationToken;

/// Admits at most `rate` acquisitions per second with bursts up to `burst`.
///
/// The bucket is tracked as the theoretical arrival time of the next token:
/// a full bucket means that time lies `burst - 1` intervals in the past or
/// earlier. Waiters queue on a fair async mutex, so tokens are handed out in
/// arrival order.
pub struct RateGate {
    next_token: Mutex<Instant>,
    interval: Duration,
    tolerance: Duration,
    burst: u32,
}

impl RateGate {
    /// Create a gate that starts with a full bucket.
    pub fn new(rate_per_second: f64, burst: u32) -> PipelineResult<Self> {
        if !(rate_per_second > 0.0 && rate_per_second.is_finite()) {
            return Err(PipelineError::InvalidConfig(format!(
                "rate must be a positive number, got {}",
                rate_per_second
            )));
        }
        let burst = burst.max(1);
        let interval = Duration::from_secs_f64(1.0 / rate_per_second);
        Ok(Self {
            next_token: Mutex::new(Instant::now()),
            interval,
            tolerance: interval * (burst - 1),
            burst,
        })
    }

    /// Earliest instant at which a token is available, given the scheduled arrival.
    fn earliest(&self, scheduled: Instant, now: Instant) -> Instant {
        let scheduled = scheduled.max(now);
        scheduled.checked_sub(self.tolerance).unwrap_or(now)
    }

    /// Wait for a token.
    ///
    /// Returns the token's reason if it fires first, in which case no token is
    /// consumed.
    pub async fn acquire(&self, token: &CancellationToken) -> PipelineResult<()> {
        if let Some(reason) = token.err() {
            return Err(reason.into());
        }
        let mut next_token = token.run_until_cancelled(self.next_token.lock()).await?;

        loop {
            let now = Instant::now();
            let earliest = self.earliest(*next_token, now);
            if now >= earliest {
                *next_token = (*next_token).max(now) + self.interval;
                return Ok(());
            }
            tracing::trace!("Rate gate waiting {:?}", earliest - now);
            token
                .run_until_cancelled(tokio::time::sleep_until(earliest))
                .await?;
        }
    }

    /// Take a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut next_token) = self.next_token.try_lock() else {
            return false;
        };
        let now = Instant::now();
        if now >= self.earliest(*next_token, now) {
            *next_token = (*next_token).max(now) + self.interval;
            true
        } else {
            false
        }
    }

    /// Whole tokens currently in the bucket. Zero while another caller holds the gate.
    pub fn available(&self) -> u32 {
        let Ok(next_token) = self.next_token.try_lock() else {
            return 0;
        };
        let backlog = next_token.saturating_duration_since(Instant::now());
        let interval = self.interval.as_nanos().max(1);
        let used = backlog.as_nanos().div_ceil(interval);
        u32::try_from(used).map_or(0, |used| self.burst.saturating_sub(used))
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Minimum spacing between tokens once the burst is spent.
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("interval", &self.interval)
            .field("burst", &self.burst)
            .finish()
    }
}
