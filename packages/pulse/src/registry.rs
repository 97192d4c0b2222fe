//! Handler registry and the handler-facing execution interface.
//!
//! Handlers are registered explicitly at pool construction; there is no
//! registration by import side effect, and a missing handler is a
//! first-class terminal failure rather than a panic. The registry is
//! populated once and read-only afterwards.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::job::{Job, JobStatus};
use crate::queue::JobQueue;

/// Successful handler return.
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    /// Actual spend in USD, recorded on the job and fed to the budget
    /// ledger's windows.
    pub cost_actual: f64,
    /// Final checkpoint, persisted with completion.
    pub checkpoint: Option<Vec<u8>>,
}

impl HandlerOutcome {
    pub fn with_cost(cost_actual: f64) -> Self {
        Self {
            cost_actual,
            checkpoint: None,
        }
    }
}

/// Handler failure, classified by the handler itself.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub message: String,
    /// Whether the queue may retry while attempts remain.
    pub retryable: bool,
    /// Checkpoint to persist so a retry can resume.
    pub checkpoint: Option<Vec<u8>>,
}

impl HandlerFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            checkpoint: None,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            checkpoint: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Vec<u8>) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HandlerFailure {}

pub type HandlerResult = Result<HandlerOutcome, HandlerFailure>;

/// Streams progress back to the queue and surfaces cancellation.
///
/// Handlers are expected to call [`ProgressReporter::report`] between
/// natural units of work and stop promptly when it returns `true`. Reports
/// are autocommit writes; a failed write is logged and does not interrupt
/// the handler.
#[derive(Clone)]
pub struct ProgressReporter {
    queue: JobQueue,
    job_id: String,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub(crate) fn new(queue: JobQueue, job_id: String, cancel: CancellationToken) -> Self {
        Self {
            queue,
            job_id,
            cancel,
        }
    }

    /// Record progress and an optional checkpoint.
    ///
    /// Returns `true` when the handler should stop: either the shared
    /// shutdown signal fired or the job was paused by the user.
    pub async fn report(&self, current: i64, total: i64, checkpoint: Option<&[u8]>) -> bool {
        if let Err(e) = self
            .queue
            .update_progress(&self.job_id, current, total, checkpoint)
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "progress update failed");
        }

        if self.cancel.is_cancelled() {
            return true;
        }

        // Cooperative pause: the status flip happens out-of-band, the
        // handler notices here.
        matches!(
            self.queue.get(&self.job_id).await.map(|j| j.status),
            Ok(JobStatus::Paused)
        )
    }

    /// Whether shutdown has been requested, without writing progress.
    pub fn cancellation_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A unit of executable job logic registered under a handler name.
///
/// Handlers must honor the cancellation token at progress reports and
/// between natural work units, and are expected to be idempotent keyed by
/// (job id, checkpoint) - the queue guarantees at-least-once, not
/// exactly-once, across crashes.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(
        &self,
        cancel: CancellationToken,
        job: Job,
        progress: ProgressReporter,
    ) -> HandlerResult;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(CancellationToken, Job, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn run(
        &self,
        cancel: CancellationToken,
        job: Job,
        progress: ProgressReporter,
    ) -> HandlerResult {
        (self.f)(cancel, job, progress).await
    }
}

/// Maps `handler_name` to executable handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. Last registration wins.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(CancellationToken, Job, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler { f }));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
