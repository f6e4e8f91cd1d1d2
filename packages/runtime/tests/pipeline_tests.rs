#![allow(clippy::disallowed_methods)]

mod common;

use std::collections::HashSet;
use std::error::Error;
use std::time::Duration;

use pipeline_runtime::{
    CancellationToken, FanOutRouter, Job, JobError, LaneOutcome, Pipeline, PipelineError,
    PoolConfig, WorkerPool,
};
use tokio::sync::mpsc;

use common::{init_tracing, numbered, sleepy_echo};

async fn pools(count: usize, delay: Duration) -> Result<Vec<WorkerPool>, PipelineError> {
    let mut pools = Vec::with_capacity(count);
    for _ in 0..count {
        let config = PoolConfig::default()
            .with_workers(1, 2)
            .with_scaling(Duration::from_millis(20), 1.0, 4.0);
        pools.push(WorkerPool::start(config, sleepy_echo(delay)).await?);
    }
    Ok(pools)
}

fn feed(jobs: Vec<Job>) -> mpsc::Receiver<Result<Job, PipelineError>> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        for job in jobs {
            if tx.send(Ok(job)).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_job_yields_exactly_one_result() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let routers = [
        FanOutRouter::round_robin(),
        FanOutRouter::by_key(|job| job.payload["n"].as_u64().unwrap_or_default()),
        FanOutRouter::least_loaded().with_lane_capacity(2),
    ];

    for router in routers {
        let pipeline = Pipeline::new(router, pools(3, Duration::from_millis(2)).await?);
        let jobs: Vec<Job> = (0..60).map(|n| numbered("work", n)).collect();
        let submitted: HashSet<_> = jobs.iter().map(|job| job.id).collect();

        let merged = pipeline.run(feed(jobs), &CancellationToken::new())?;
        let (results, status) =
            tokio::time::timeout(Duration::from_secs(10), merged.collect_all()).await?;

        assert_eq!(status, Ok(()));
        assert_eq!(results.len(), 60);
        assert!(results.iter().all(|r| r.is_ok()));
        let returned: HashSet<_> = results.iter().map(|r| r.job_id).collect();
        assert_eq!(returned, submitted);

        pipeline.close().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelling_mid_run_ends_the_stream() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let pipeline = Pipeline::new(
        FanOutRouter::round_robin(),
        pools(2, Duration::from_millis(20)).await?,
    );

    // A producer that never finishes on its own.
    let (tx, rx) = mpsc::channel(4);
    let producer = tokio::spawn(async move {
        let mut n = 0;
        while tx.send(Ok(numbered("work", n))).await.is_ok() {
            n += 1;
        }
    });

    let token = CancellationToken::new();
    let mut merged = pipeline.run(rx, &token)?;
    let mut received = 0;
    while received < 5 {
        match merged.next().await {
            Some(_) => received += 1,
            None => break,
        }
    }
    assert_eq!(received, 5);
    token.cancel();

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        let mut rest = Vec::new();
        while let Some(result) = merged.next().await {
            rest.push(result);
        }
        rest
    })
    .await?;
    // Jobs still running when the token fired report the cancellation.
    assert!(drained.iter().all(|r| r.is_ok() || r.error == Some(JobError::Cancelled)));
    assert_eq!(merged.status(), Err(PipelineError::Cancelled));
    assert!(
        merged
            .summary()
            .iter()
            .any(|lane| lane.outcome == Some(LaneOutcome::Cancelled))
    );

    tokio::time::timeout(Duration::from_secs(5), producer).await??;
    pipeline.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_lane_does_not_stop_healthy_lanes() -> Result<(), Box<dyn Error>> {
    init_tracing();
    let lanes = pools(2, Duration::from_millis(1)).await?;
    lanes[1].close().await?;
    let pipeline = Pipeline::new(FanOutRouter::round_robin(), lanes);

    let jobs: Vec<Job> = (0..20).map(|n| numbered("work", n)).collect();
    let submitted: HashSet<_> = jobs.iter().map(|job| job.id).collect();
    let merged = pipeline.run(feed(jobs), &CancellationToken::new())?;
    let (results, status) =
        tokio::time::timeout(Duration::from_secs(10), merged.collect_all()).await?;

    match status {
        Err(PipelineError::LaneFailed { lane, reason }) => {
            assert_eq!(lane, 1);
            assert!(reason.contains("closed"), "unexpected reason: {}", reason);
        }
        other => panic!("expected lane 1 to fail, got {:?}", other),
    }
    // Every job comes back once: lane 0 runs its share and the closed lane
    // reports each of its jobs as failed.
    assert_eq!(results.len(), 20);
    let returned: HashSet<_> = results.iter().map(|r| r.job_id).collect();
    assert_eq!(returned, submitted);
    let (succeeded, refused): (Vec<_>, Vec<_>) = results.iter().partition(|r| r.is_ok());
    assert!(!succeeded.is_empty());
    assert!(!refused.is_empty());
    for result in refused {
        match &result.error {
            Some(JobError::Failed(msg)) => assert!(msg.contains("closed"), "unexpected: {}", msg),
            other => panic!("expected a refused job, got {:?}", other),
        }
    }

    pipeline.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_pipeline_without_lanes_is_rejected() {
    let pipeline = Pipeline::new(FanOutRouter::round_robin(), Vec::new());
    let (_tx, rx) = mpsc::channel(1);
    assert!(matches!(
        pipeline.run(rx, &CancellationToken::new()),
        Err(PipelineError::InvalidConfig(_))
    ));
}
