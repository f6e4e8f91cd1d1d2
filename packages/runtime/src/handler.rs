//! Job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use pipeline_core::Job;

use crate::cancel::CancellationToken;

/// Result type for job handlers.
pub type HandlerResult = Result<Option<serde_json::Value>, String>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Future type for batch handlers, resolving to one result per job in order.
pub type BatchFuture = Pin<Box<dyn Future<Output = Vec<HandlerResult>> + Send>>;

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of a specific type are processed.
/// Handlers receive the job's cancellation token and are expected to observe
/// it; a running handler is never forcibly stopped.
pub trait JobHandler: Send + Sync + 'static {
    /// The job type this handler processes.
    fn job_type(&self) -> &str;

    /// Process a job and return its output value.
    fn handle(&self, job: &Job, token: &CancellationToken) -> HandlerFuture;

    /// Process a batch. The default runs jobs one after another.
    fn handle_batch(&self, jobs: &[Job], token: &CancellationToken) -> BatchFuture {
        let pending: Vec<HandlerFuture> = jobs.iter().map(|job| self.handle(job, token)).collect();
        Box::pin(async move {
            let mut results = Vec::with_capacity(pending.len());
            for fut in pending {
                results.push(fut.await);
            }
            results
        })
    }
}

/// Registry for job handlers.
///
/// Maps job types to their handlers; the registry itself is a handler that
/// dispatches on [`Job::job_type`].
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a job type.
    pub fn register<H: JobHandler>(&mut self, handler: H) {
        let job_type = handler.job_type().to_string();
        self.handlers.insert(job_type, Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<H: JobHandler>(mut self, handler: H) -> Self {
        self.register(handler);
        self
    }

    /// Get a handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    /// Check if a handler exists for a job type.
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// List all registered job types.
    pub fn job_types(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl JobHandler for JobHandlerRegistry {
    fn job_type(&self) -> &str {
        "*"
    }

    fn handle(&self, job: &Job, token: &CancellationToken) -> HandlerFuture {
        match self.handlers.get(&job.job_type) {
            Some(handler) => handler.handle(job, token),
            None => {
                let error = format!("No handler for job type: {}", job.job_type);
                Box::pin(async move { Err(error) })
            }
        }
    }
}

/// A simple function-based job handler.
pub struct FnHandler<F>
where
    F: Fn(&Job, &CancellationToken) -> HandlerFuture + Send + Sync + 'static,
{
    job_type: String,
    handler: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Job, &CancellationToken) -> HandlerFuture + Send + Sync + 'static,
{
    /// Create a new function-based handler.
    pub fn new(job_type: impl Into<String>, handler: F) -> Self {
        Self {
            job_type: job_type.into(),
            handler,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job, &CancellationToken) -> HandlerFuture + Send + Sync + 'static,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn handle(&self, job: &Job, token: &CancellationToken) -> HandlerFuture {
        (self.handler)(job, token)
    }
}

/// Helper macro for creating job handlers from async closures.
///
/// The body receives owned clones of the job and its token.
#[macro_export]
macro_rules! job_handler {
    ($job_type:expr, |$job:ident, $token:ident| $body:expr) => {
        $crate::FnHandler::new(
            $job_type,
            |$job: &$crate::Job, $token: &$crate::CancellationToken| -> $crate::HandlerFuture {
                let $job = $job.clone();
                let $token = $token.clone();
                Box::pin(async move {
                    let result: $crate::HandlerResult = { $body };
                    result
                })
            },
        )
    };
}
