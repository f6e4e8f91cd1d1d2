//! Size- or time-triggered batching.

use std::time::Duration;

use pipeline_core::{PipelineError, PipelineResult};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cancel::CancellationToken;

/// What caused a batch to be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached `max_size`.
    Size,
    /// `max_wait` elapsed since the first item of the cycle.
    Timer,
    /// An explicit `flush` call.
    Manual,
    /// The accumulator was closed with items pending.
    Close,
}

/// A non-empty group of items flushed together.
#[derive(Debug)]
pub struct Batch<T> {
    pub items: Vec<T>,
    /// Accumulation cycle this batch closed, starting at 1.
    pub cycle: u64,
    pub trigger: FlushTrigger,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Synchronous batching state machine.
///
/// A cycle starts with the first item pushed into an empty accumulator and ends
/// with exactly one flush, whichever trigger comes first. Empty batches are
/// never produced.
#[derive(Debug)]
pub struct Accumulator<T> {
    items: Vec<T>,
    max_size: usize,
    max_wait: Duration,
    deadline: Option<Instant>,
    cycle: u64,
}

impl<T> Accumulator<T> {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        let max_size = max_size.max(1);
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
            max_wait,
            deadline: None,
            cycle: 0,
        }
    }

    /// Add an item, returning the batch if this item filled it.
    pub fn push(&mut self, item: T, now: Instant) -> Option<Batch<T>> {
        if self.items.is_empty() {
            self.deadline = Some(now + self.max_wait);
        }
        self.items.push(item);
        if self.items.len() >= self.max_size {
            return self.take(FlushTrigger::Size);
        }
        None
    }

    /// Timer deadline of the current cycle, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Flush if the current cycle's deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Batch<T>> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.take(FlushTrigger::Timer),
            _ => None,
        }
    }

    /// Flush whatever is pending.
    pub fn flush(&mut self, trigger: FlushTrigger) -> Option<Batch<T>> {
        self.take(trigger)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn take(&mut self, trigger: FlushTrigger) -> Option<Batch<T>> {
        self.deadline = None;
        if self.items.is_empty() {
            return None;
        }
        self.cycle += 1;
        Some(Batch {
            items: std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size)),
            cycle: self.cycle,
            trigger,
        })
    }
}

enum Command<T> {
    Add(T),
    Flush,
    Close,
}

/// Handle to a running batch accumulator task.
///
/// Batches are delivered on the receiver returned by [`BatchAccumulator::spawn`].
/// The receiver ends after `close`, after every handle is dropped, or when the
/// accumulator's token fires. Items pending at cancellation are discarded.
pub struct BatchAccumulator<T> {
    commands: mpsc::Sender<Command<T>>,
}

impl<T> Clone for BatchAccumulator<T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<T: Send + 'static> BatchAccumulator<T> {
    pub fn spawn(
        max_size: usize,
        max_wait: Duration,
        token: CancellationToken,
    ) -> (Self, mpsc::Receiver<Batch<T>>) {
        let (commands, command_rx) = mpsc::channel(max_size.max(1) * 2);
        let (batch_tx, batch_rx) = mpsc::channel(1);
        tokio::spawn(run(
            Accumulator::new(max_size, max_wait),
            command_rx,
            batch_tx,
            token,
        ));
        (Self { commands }, batch_rx)
    }

    /// Add an item to the current cycle.
    ///
    /// Waits while the accumulator is backed up, giving up when `token` fires.
    pub async fn add(&self, item: T, token: &CancellationToken) -> PipelineResult<()> {
        self.send(Command::Add(item), token).await
    }

    /// Flush the pending partial batch, if any.
    pub async fn flush(&self, token: &CancellationToken) -> PipelineResult<()> {
        self.send(Command::Flush, token).await
    }

    async fn send(&self, command: Command<T>, token: &CancellationToken) -> PipelineResult<()> {
        token
            .run_until_cancelled(self.commands.send(command))
            .await?
            .map_err(|_| PipelineError::QueueClosed)
    }

    /// Flush pending items and stop accepting new ones.
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run<T>(
    mut acc: Accumulator<T>,
    mut commands: mpsc::Receiver<Command<T>>,
    batches: mpsc::Sender<Batch<T>>,
    token: CancellationToken,
) {
    loop {
        let ready = tokio::select! {
            biased;
            reason = token.cancelled() => {
                tracing::debug!(
                    "Batch accumulator stopping ({}), discarding {} items",
                    reason,
                    acc.len()
                );
                break;
            }
            command = commands.recv() => match command {
                Some(Command::Add(item)) => acc.push(item, Instant::now()),
                Some(Command::Flush) => acc.flush(FlushTrigger::Manual),
                Some(Command::Close) | None => {
                    if let Some(batch) = acc.flush(FlushTrigger::Close) {
                        let _ = token.run_until_cancelled(batches.send(batch)).await;
                    }
                    break;
                }
            },
            _ = sleep_until(acc.deadline()) => acc.poll_expired(Instant::now()),
        };

        if let Some(batch) = ready {
            tracing::trace!(
                "Flushing batch {} ({} items, {:?})",
                batch.cycle,
                batch.len(),
                batch.trigger
            );
            match token.run_until_cancelled(batches.send(batch)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[test]
    fn size_trigger_flushes_full_batch() {
        let now = Instant::now();
        let mut acc = Accumulator::new(3, Duration::from_secs(1));
        assert!(acc.push(1, now).is_none());
        assert!(acc.push(2, now).is_none());
        let batch = acc.push(3, now).expect("batch should be full");
        assert_eq!(batch.items, vec![1, 2, 3]);
        assert_eq!(batch.trigger, FlushTrigger::Size);
        assert_eq!(batch.cycle, 1);
        assert_eq!(acc.deadline(), None);
    }

    #[test]
    fn timer_flush_happens_once_per_cycle() {
        let now = Instant::now();
        let mut acc = Accumulator::new(10, Duration::from_millis(50));
        acc.push("a", now);
        acc.push("b", now + Duration::from_millis(20));

        assert!(acc.poll_expired(now + Duration::from_millis(49)).is_none());
        let batch = acc
            .poll_expired(now + Duration::from_millis(50))
            .expect("deadline passed");
        assert_eq!(batch.items, vec!["a", "b"]);
        assert_eq!(batch.trigger, FlushTrigger::Timer);
        assert!(acc.poll_expired(now + Duration::from_millis(100)).is_none());
    }

    #[test]
    fn size_flush_disarms_timer() {
        let now = Instant::now();
        let mut acc = Accumulator::new(1, Duration::from_millis(10));
        assert!(acc.push(1, now).is_some());
        assert!(acc.poll_expired(now + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn empty_accumulator_never_flushes() {
        let mut acc: Accumulator<u8> = Accumulator::new(4, Duration::from_millis(10));
        assert!(acc.flush(FlushTrigger::Manual).is_none());
        assert!(acc.poll_expired(Instant::now()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_flushes_after_max_wait() -> Result<(), PipelineError> {
        let token = CancellationToken::new();
        let (acc, mut batches) =
            BatchAccumulator::spawn(10, Duration::from_millis(100), token.clone());
        let start = Instant::now();
        acc.add(1, &token).await?;
        acc.add(2, &token).await?;

        let batch = batches.recv().await.expect("timer flush");
        assert_eq!(batch.items, vec![1, 2]);
        assert_eq!(batch.trigger, FlushTrigger::Timer);
        assert!(start.elapsed() >= Duration::from_millis(100));
        Ok(())
    }

    #[tokio::test]
    async fn full_batches_flush_without_waiting() -> Result<(), PipelineError> {
        let token = CancellationToken::new();
        let (acc, mut batches) = BatchAccumulator::spawn(2, Duration::from_secs(60), token.clone());
        for n in 0..4 {
            acc.add(n, &token).await?;
        }

        let first = batches.recv().await.expect("first batch");
        let second = batches.recv().await.expect("second batch");
        assert_eq!(first.items, vec![0, 1]);
        assert_eq!(second.items, vec![2, 3]);
        assert_eq!(second.cycle, 2);
        Ok(())
    }

    #[tokio::test]
    async fn close_flushes_remainder_and_ends_stream() -> Result<(), PipelineError> {
        let token = CancellationToken::new();
        let (acc, mut batches) = BatchAccumulator::spawn(5, Duration::from_secs(60), token.clone());
        acc.add("x", &token).await?;
        acc.close().await;

        let batch = batches.recv().await.expect("close flush");
        assert_eq!(batch.trigger, FlushTrigger::Close);
        assert_eq!(batch.items, vec!["x"]);
        assert!(batches.recv().await.is_none());
        assert_eq!(acc.add("y", &token).await, Err(PipelineError::QueueClosed));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn backed_up_add_observes_caller_cancellation() {
        let (acc, _batches) =
            BatchAccumulator::spawn(1, Duration::from_secs(60), CancellationToken::new());
        let caller = CancellationToken::new();
        let canceller = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        // Nobody drains the batches, so adds eventually block.
        let mut accepted = 0;
        let stopped = loop {
            match acc.add(accepted, &caller).await {
                Ok(()) => accepted += 1,
                Err(err) => break err,
            }
            assert!(accepted < 100, "add never blocked");
        };
        assert_eq!(stopped, PipelineError::Cancelled);
        assert_eq!(acc.add(0, &caller).await, Err(PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_ends_stream() -> Result<(), PipelineError> {
        let token = CancellationToken::new();
        let (acc, mut batches) = BatchAccumulator::spawn(5, Duration::from_secs(60), token.clone());
        acc.add(1, &token).await?;
        token.cancel();
        assert!(batches.recv().await.is_none());
        Ok(())
    }
}
