#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pipeline_runtime::{CancellationToken, FnHandler, HandlerFuture, Job, JobHandler, PoolEvent};
use serde_json::json;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once. Set `RUST_LOG` to see pool logs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn numbered(job_type: &str, n: u64) -> Job {
    Job::new(job_type, json!({ "n": n }))
}

/// Echoes `payload.n` after `delay`, returning early with an error if cancelled.
pub fn sleepy_echo(delay: Duration) -> Arc<dyn JobHandler> {
    Arc::new(FnHandler::new(
        "work",
        move |job: &Job, token: &CancellationToken| -> HandlerFuture {
            let n = job.payload["n"].clone();
            let token = token.clone();
            Box::pin(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(Some(n)),
                    reason = token.cancelled() => Err(format!("stopped: {}", reason)),
                }
            })
        },
    ))
}

/// Receive events until one matches, or give up after `limit`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<PoolEvent>,
    limit: Duration,
    matches: impl Fn(&PoolEvent) -> bool,
) -> Option<PoolEvent> {
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll `check` every few milliseconds until it holds or `limit` elapses.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
