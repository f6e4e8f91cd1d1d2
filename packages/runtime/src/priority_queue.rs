//! Two-lane job buffer with a starvation ceiling.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use pipeline_core::{Job, OverflowPolicy, PipelineError, PipelineResult, Priority};
use tokio::sync::Notify;

use crate::cancel::CancellationToken;

/// Anything that can be queued on a priority lane.
pub trait Prioritized {
    fn priority(&self) -> Priority;
}

impl Prioritized for Job {
    fn priority(&self) -> Priority {
        self.priority
    }
}

/// Lane contents and fairness bookkeeping, guarded by the queue's single lock.
struct Lanes<T> {
    high: VecDeque<T>,
    low: VecDeque<T>,
    /// High services in a row while low work was waiting.
    high_streak: u32,
    ceiling: u32,
    closed: bool,
}

impl<T> Lanes<T> {
    fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }

    fn push(&mut self, item: T, priority: Priority) {
        match priority {
            Priority::High => self.high.push_back(item),
            Priority::Low => self.low.push_back(item),
        }
    }

    fn pop(&mut self) -> Option<T> {
        let low_waiting = !self.low.is_empty();
        let serve_low = low_waiting && (self.high.is_empty() || self.high_streak >= self.ceiling);

        if serve_low {
            self.high_streak = 0;
            return self.low.pop_front();
        }

        let item = self.high.pop_front()?;
        if low_waiting {
            self.high_streak += 1;
        }
        Some(item)
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub high: usize,
    pub low: usize,
    pub closed: bool,
}

/// A bounded or unbounded two-lane FIFO.
///
/// Dequeue serves the high lane until `starvation_ceiling` consecutive high
/// items have been served while low work was waiting, then serves one low item.
/// A low item at the head of its lane therefore waits at most K high dequeues.
pub struct PriorityQueue<T> {
    lanes: Mutex<Lanes<T>>,
    not_empty: Notify,
    not_full: Notify,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl<T: Prioritized> PriorityQueue<T> {
    pub fn new(capacity: Option<usize>, overflow: OverflowPolicy, starvation_ceiling: u32) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                low: VecDeque::new(),
                high_streak: 0,
                ceiling: starvation_ceiling.max(1),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity,
            overflow,
        }
    }

    /// Create an unbounded queue.
    pub fn unbounded(starvation_ceiling: u32) -> Self {
        Self::new(None, OverflowPolicy::Block, starvation_ceiling)
    }

    fn lock(&self) -> MutexGuard<'_, Lanes<T>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue using the queue's configured overflow policy.
    pub async fn enqueue(&self, item: T, token: &CancellationToken) -> PipelineResult<()> {
        self.enqueue_with(item, token, self.overflow).await
    }

    /// Enqueue with an explicit overflow policy.
    ///
    /// With [`OverflowPolicy::Block`] a full queue suspends the caller until space
    /// frees up, the queue closes, or `token` fires.
    pub async fn enqueue_with(
        &self,
        item: T,
        token: &CancellationToken,
        overflow: OverflowPolicy,
    ) -> PipelineResult<()> {
        if let Some(reason) = token.err() {
            return Err(reason.into());
        }
        let priority = item.priority();

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut lanes = self.lock();
                if lanes.closed {
                    return Err(PipelineError::QueueClosed);
                }
                if self.capacity.is_none_or(|cap| lanes.len() < cap) {
                    lanes.push(item, priority);
                    drop(lanes);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
                if overflow == OverflowPolicy::Reject {
                    return Err(PipelineError::QueueFull);
                }
            }

            token.run_until_cancelled(&mut notified).await?;
        }
    }

    /// Take the next item.
    ///
    /// Returns `Ok(None)` once the queue is closed and empty, and an error only
    /// when `token` fires first.
    pub async fn dequeue(&self, token: &CancellationToken) -> PipelineResult<Option<T>> {
        if let Some(reason) = token.err() {
            return Err(reason.into());
        }

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut lanes = self.lock();
                if let Some(item) = lanes.pop() {
                    drop(lanes);
                    self.not_full.notify_waiters();
                    return Ok(Some(item));
                }
                if lanes.closed {
                    return Ok(None);
                }
            }

            token.run_until_cancelled(&mut notified).await?;
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<T> {
        let item = self.lock().pop();
        if item.is_some() {
            self.not_full.notify_waiters();
        }
        item
    }

    /// Stop accepting items. Queued items remain available to `dequeue`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Remove every queued item, high lane first.
    pub fn drain(&self) -> Vec<T> {
        let mut lanes = self.lock();
        let mut items: Vec<T> = lanes.high.drain(..).collect();
        items.extend(lanes.low.drain(..));
        lanes.high_streak = 0;
        drop(lanes);
        self.not_full.notify_waiters();
        items
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn depth(&self) -> QueueDepth {
        let lanes = self.lock();
        QueueDepth {
            high: lanes.high.len(),
            low: lanes.low.len(),
            closed: lanes.closed,
        }
    }
}
