#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pipeline_runtime::{
    BatchFuture, CancellationToken, FnHandler, HandlerFuture, Job, JobError, JobHandler,
    OverflowPolicy, PipelineError, PoolConfig, PoolEvent, Priority, WorkerPool,
};
use serde_json::json;
use tokio::sync::Semaphore;

use common::{eventually, init_tracing, numbered, sleepy_echo, wait_for_event};

/// Handler that records the order jobs start in and holds each one until a permit is available.
fn gated(gate: Arc<Semaphore>, order: Arc<Mutex<Vec<u64>>>) -> Arc<dyn JobHandler> {
    Arc::new(FnHandler::new(
        "work",
        move |job: &Job, _token: &CancellationToken| -> HandlerFuture {
            let n = job.payload["n"].as_u64().unwrap_or_default();
            let gate = gate.clone();
            let order = order.clone();
            Box::pin(async move {
                let permit = gate.acquire().await.map_err(|e| e.to_string())?;
                permit.forget();
                order.lock().map_err(|e| e.to_string())?.push(n);
                Ok(Some(json!(n)))
            })
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scales_to_max_under_load_and_back_to_min() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let config = PoolConfig::default()
        .with_workers(1, 4)
        .with_scaling(Duration::from_millis(20), 1.0, 5.0);
    let pool = WorkerPool::start(config, sleepy_echo(Duration::from_millis(20))).await?;

    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let sampler = {
        let pool = pool.clone();
        let peak = peak.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::Acquire) {
                peak.fetch_max(pool.active_workers(), Ordering::AcqRel);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let mut submitted = HashSet::new();
    let mut handles = Vec::new();
    for n in 0..100 {
        let job = numbered("work", n);
        submitted.insert(job.id);
        handles.push(pool.submit(job).await?);
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let expected = handle.job_id();
        let result = handle.await?;
        assert_eq!(result.job_id, expected);
        assert!(result.is_ok(), "unexpected error: {:?}", result.error);
        assert!(seen.insert(result.job_id), "duplicate result for {}", result.job_id);
    }
    assert_eq!(seen, submitted);

    done.store(true, Ordering::Release);
    sampler.await?;
    assert_eq!(peak.load(Ordering::Acquire), 4);

    assert!(
        eventually(Duration::from_secs(3), || pool.active_workers() == 1).await,
        "pool did not shrink back to min_workers"
    );

    pool.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stats_keep_counts_of_retired_workers() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let config = PoolConfig::default()
        .with_workers(1, 8)
        .with_scaling(Duration::from_millis(2), 1.0, 2.0);
    let pool = WorkerPool::start(config, sleepy_echo(Duration::from_millis(2))).await?;

    let mut handles = Vec::new();
    for n in 0..300 {
        handles.push(pool.submit(numbered("work", n)).await?);
    }
    for handle in handles {
        assert!(handle.await?.is_ok());
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let stats = loop {
        let stats = pool.stats().await?;
        if stats.workers.len() == 1 || Instant::now() > deadline {
            break stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(stats.workers.len(), 1, "pool did not shrink back to one worker");
    assert_eq!(stats.jobs_processed, 300);
    assert_eq!(stats.errors, 0);

    pool.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batched_submit_gives_up_when_caller_cancels() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let config = PoolConfig::default()
        .with_workers(1, 1)
        .with_batching(1, Duration::from_millis(10))
        .with_queue_capacity(1, OverflowPolicy::Block);
    let pool = WorkerPool::start(config, sleepy_echo(Duration::from_secs(600))).await?;

    let caller = CancellationToken::new();
    let canceller = {
        let caller = caller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            caller.cancel();
        })
    };

    let mut handles = Vec::new();
    let refused = tokio::time::timeout(Duration::from_secs(5), async {
        for n in 0..100 {
            match pool.submit_with(numbered("work", n), &caller).await {
                Ok(handle) => handles.push(handle),
                Err(err) => return Some(err),
            }
        }
        None
    })
    .await?;
    assert_eq!(refused, Some(PipelineError::Cancelled));
    canceller.await?;

    let again = tokio::time::timeout(
        Duration::from_secs(1),
        pool.submit_with(numbered("work", 100), &caller),
    )
    .await?;
    assert!(matches!(again, Err(PipelineError::Cancelled)));

    tokio::time::timeout(Duration::from_secs(5), pool.close_now()).await??;
    drop(handles);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_job_becomes_worker_fault() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let handler = Arc::new(FnHandler::new(
        "work",
        |job: &Job, _token: &CancellationToken| -> HandlerFuture {
            let n = job.payload["n"].as_u64();
            Box::pin(async move {
                if n == Some(7) {
                    panic!("job 7 exploded");
                }
                Ok(n.map(|n| json!(n)))
            })
        },
    ));
    let pool = WorkerPool::start(PoolConfig::default().with_workers(2, 2), handler).await?;

    let jobs: Vec<Job> = (0..20).map(|n| numbered("work", n)).collect();
    let faulty = jobs[7].id;
    let mut handles = Vec::new();
    for job in jobs {
        handles.push(pool.submit(job).await?);
    }

    let mut faults = 0;
    for handle in handles {
        let result = handle.await?;
        if result.job_id == faulty {
            assert!(
                matches!(
                    &result.error,
                    Some(JobError::WorkerFault(msg)) if msg.contains("exploded")
                ),
                "expected a worker fault, got {:?}",
                result.error
            );
            faults += 1;
        } else {
            assert!(result.is_ok());
        }
    }
    assert_eq!(faults, 1);

    // The pool keeps serving after the fault.
    let after = pool.submit(numbered("work", 99)).await?.await?;
    assert_eq!(after.value, Some(json!(99)));
    assert_eq!(pool.active_workers(), 2);

    pool.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_high_priority_jobs_overtake_queued_low_ones() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let gate = Arc::new(Semaphore::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    let pool = WorkerPool::start(
        PoolConfig::default().with_workers(1, 1),
        gated(gate.clone(), order.clone()),
    )
    .await?;
    let mut events = pool.subscribe();

    let mut handles = vec![pool.submit(numbered("work", 0)).await?];
    let started = wait_for_event(&mut events, Duration::from_secs(2), |e| {
        matches!(e, PoolEvent::JobStarted { .. })
    })
    .await;
    assert!(started.is_some(), "blocking job never started");

    for n in [1, 2, 3] {
        handles.push(pool.submit(numbered("work", n)).await?);
    }
    for n in [10, 11] {
        let job = numbered("work", n).with_priority(Priority::High);
        handles.push(pool.submit(job).await?);
    }
    gate.add_permits(handles.len());

    for handle in handles {
        assert!(handle.await?.is_ok());
    }
    assert_eq!(*order.lock().map_err(|e| e.to_string())?, vec![0, 10, 11, 1, 2, 3]);

    pool.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_rejects_under_reject_policy() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let gate = Arc::new(Semaphore::new(0));
    let config = PoolConfig::default()
        .with_workers(1, 1)
        .with_queue_capacity(2, OverflowPolicy::Reject);
    let pool = WorkerPool::start(config, gated(gate.clone(), Arc::default())).await?;
    let mut events = pool.subscribe();

    let running = pool.submit(numbered("work", 0)).await?;
    let started = wait_for_event(&mut events, Duration::from_secs(2), |e| {
        matches!(e, PoolEvent::JobStarted { .. })
    })
    .await;
    assert!(started.is_some());

    let queued = vec![
        pool.submit(numbered("work", 1)).await?,
        pool.submit(numbered("work", 2)).await?,
    ];
    assert_eq!(pool.pending_jobs(), 2);
    let rejected = pool.submit(numbered("work", 3)).await;
    assert!(matches!(rejected, Err(PipelineError::QueueFull)));

    gate.add_permits(3);
    assert!(running.await?.is_ok());
    for handle in queued {
        assert!(handle.await?.is_ok());
    }

    pool.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_job_timeout_reports_deadline_exceeded() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let pool = WorkerPool::start(
        PoolConfig::default().with_workers(1, 1),
        sleepy_echo(Duration::from_secs(30)),
    )
    .await?;

    let job = numbered("work", 1).with_timeout(Duration::from_millis(30));
    let started = Instant::now();
    let result = pool.submit(job).await?.await?;

    assert_eq!(result.error, Some(JobError::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(5));

    pool.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_spaces_job_starts() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let config = PoolConfig::default()
        .with_workers(2, 2)
        .with_rate_limit(20.0, 1);
    let pool = WorkerPool::start(config, sleepy_echo(Duration::ZERO)).await?;

    let started = Instant::now();
    let mut handles = Vec::new();
    for n in 0..5 {
        handles.push(pool.submit(numbered("work", n)).await?);
    }
    for handle in handles {
        assert!(handle.await?.is_ok());
    }

    // Five admissions at 20/s with no burst need four 50ms intervals.
    assert!(started.elapsed() >= Duration::from_millis(195));

    pool.close().await?;
    Ok(())
}

struct RecordingBatches {
    sizes: Arc<Mutex<Vec<usize>>>,
}

impl JobHandler for RecordingBatches {
    fn job_type(&self) -> &str {
        "work"
    }

    fn handle(&self, job: &Job, _token: &CancellationToken) -> HandlerFuture {
        let n = job.payload["n"].clone();
        Box::pin(async move { Ok(Some(n)) })
    }

    fn handle_batch(&self, jobs: &[Job], _token: &CancellationToken) -> BatchFuture {
        if let Ok(mut sizes) = self.sizes.lock() {
            sizes.push(jobs.len());
        }
        let values: Vec<_> = jobs.iter().map(|job| Ok(Some(job.payload["n"].clone()))).collect();
        Box::pin(async move { values })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batches_flush_by_size_then_timer() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let config = PoolConfig::default()
        .with_workers(1, 1)
        .with_batching(4, Duration::from_millis(100));
    let handler = Arc::new(RecordingBatches {
        sizes: sizes.clone(),
    });
    let pool = WorkerPool::start(config, handler).await?;

    let mut handles = Vec::new();
    for n in 0..10 {
        handles.push(pool.submit(numbered("work", n)).await?);
    }
    for (n, handle) in handles.into_iter().enumerate() {
        let result = handle.await?;
        assert_eq!(result.value, Some(json!(n)));
    }

    let mut recorded = sizes.lock().map_err(|e| e.to_string())?.clone();
    recorded.sort_unstable();
    assert_eq!(recorded, vec![2, 4, 4]);

    pool.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stats_and_events_track_outcomes() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let handler = Arc::new(FnHandler::new(
        "work",
        |job: &Job, _token: &CancellationToken| -> HandlerFuture {
            let n = job.payload["n"].as_u64();
            Box::pin(async move {
                match n {
                    Some(3) => Err("bad input".to_string()),
                    _ => Ok(None),
                }
            })
        },
    ));
    let pool = WorkerPool::start(PoolConfig::default().with_workers(1, 1), handler).await?;
    let mut events = pool.subscribe();

    let mut handles = Vec::new();
    for n in 0..5 {
        handles.push(pool.submit(numbered("work", n)).await?);
    }
    for handle in handles {
        handle.await?;
    }

    let failed = wait_for_event(&mut events, Duration::from_secs(2), |e| {
        matches!(e, PoolEvent::JobFailed { .. })
    })
    .await;
    assert!(matches!(
        failed,
        Some(PoolEvent::JobFailed { error: JobError::Failed(ref msg), .. }) if msg == "bad input"
    ));

    let deadline = Instant::now() + Duration::from_secs(2);
    let stats = loop {
        let stats = pool.stats().await?;
        if stats.jobs_processed == 5 || Instant::now() > deadline {
            break stats;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    assert_eq!(stats.jobs_processed, 5);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.active_workers, 1);
    assert_eq!(stats.workers.len(), 1);

    let json = serde_json::to_value(&stats)?;
    assert_eq!(json["workers"][0]["state"], "idle");

    pool.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_drains_queued_jobs() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let pool = WorkerPool::start(
        PoolConfig::default().with_workers(2, 2),
        sleepy_echo(Duration::from_millis(30)),
    )
    .await?;

    let mut handles = Vec::new();
    for n in 0..10 {
        handles.push(pool.submit(numbered("work", n)).await?);
    }
    pool.close().await?;

    for handle in handles {
        assert!(handle.await?.is_ok());
    }
    assert_eq!(pool.active_workers(), 0);
    assert!(matches!(
        pool.submit(numbered("work", 11)).await,
        Err(PipelineError::PoolClosed)
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_now_cancels_running_and_discards_queued() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let pool = WorkerPool::start(
        PoolConfig::default().with_workers(1, 1),
        sleepy_echo(Duration::from_secs(60)),
    )
    .await?;
    let mut events = pool.subscribe();

    let mut handles = Vec::new();
    for n in 0..5 {
        handles.push(pool.submit(numbered("work", n)).await?);
    }
    let started = wait_for_event(&mut events, Duration::from_secs(2), |e| {
        matches!(e, PoolEvent::JobStarted { .. })
    })
    .await;
    assert!(started.is_some());

    tokio::time::timeout(Duration::from_secs(5), pool.close_now()).await??;

    let mut handles = handles.into_iter();
    if let Some(running) = handles.next() {
        let result = running.await?;
        assert_eq!(result.error, Some(JobError::Cancelled));
    }
    for queued in handles {
        assert!(matches!(queued.await, Err(PipelineError::Cancelled)));
    }
    Ok(())
}

#[tokio::test]
async fn test_rejects_invalid_config() {
    let config = PoolConfig::default().with_workers(3, 1);
    let started = WorkerPool::start(config, sleepy_echo(Duration::ZERO)).await;
    assert!(matches!(started, Err(PipelineError::InvalidConfig(_))));
}
