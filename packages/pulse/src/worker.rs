//! Worker pool.
//!
//! N parallel workers share one cancellation signal. Each worker is
//! sequential internally: wait for a poll tick or shutdown, lease one job,
//! run it to a terminal state (or checkpoint it on cancellation), repeat.
//! No worker ever observes another worker's job.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::budget::{Admission, BudgetLedger};
use crate::job::{Job, JobStatus};
use crate::queue::JobQueue;
use crate::registry::{HandlerRegistry, ProgressReporter};

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of parallel worker tasks.
    pub workers: usize,
    /// How long to wait when no jobs are available.
    pub poll_interval: Duration,
    /// Boot marker stamped on every lease; used for orphan detection on the
    /// next start.
    pub boot_id: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval: Duration::from_secs(1),
            boot_id: format!("boot-{}", Uuid::new_v4().simple()),
        }
    }
}

/// Spawns and owns the worker tasks.
pub struct WorkerPool {
    queue: JobQueue,
    registry: Arc<HandlerRegistry>,
    budget: Arc<BudgetLedger>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        registry: Arc<HandlerRegistry>,
        budget: Arc<BudgetLedger>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            budget,
            config,
        }
    }

    pub fn boot_id(&self) -> &str {
        &self.config.boot_id
    }

    /// Spawn the worker tasks. They run until `shutdown` is cancelled, then
    /// finish (or checkpoint) their in-flight job and return.
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers.max(1))
            .map(|i| {
                let worker = Worker {
                    id: format!("worker-{i}"),
                    queue: self.queue.clone(),
                    registry: self.registry.clone(),
                    budget: self.budget.clone(),
                    poll_interval: self.config.poll_interval,
                    boot_id: self.config.boot_id.clone(),
                };
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }
}

struct Worker {
    id: String,
    queue: JobQueue,
    registry: Arc<HandlerRegistry>,
    budget: Arc<BudgetLedger>,
    poll_interval: Duration,
    boot_id: String,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.queue.lease(&self.id, &self.boot_id).await {
                Ok(Some(job)) => self.process(job, &shutdown).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "lease failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    async fn process(&self, job: Job, shutdown: &CancellationToken) {
        let job_id = job.id.clone();
        let handler_name = job.handler_name.clone();

        // Admission first; a rejected job goes straight back to the queue
        // with the reason recorded and its attempt increment undone.
        match self.budget.admit(&job).await {
            Ok(Admission::Admitted) => {}
            Ok(Admission::Rejected {
                window,
                projected,
                limit,
            }) => {
                let reason = format!(
                    "budget rejected ({window}): projected {projected:.2} over limit {limit:.2}"
                );
                debug!(job_id = %job_id, %reason, "job deferred");
                if let Err(e) = self.queue.return_unbudgeted(&job_id, &reason).await {
                    error!(job_id = %job_id, error = %e, "failed to defer job");
                }
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "budget check failed");
                if let Err(e) = self
                    .queue
                    .return_unbudgeted(&job_id, "budget check failed")
                    .await
                {
                    error!(job_id = %job_id, error = %e, "failed to defer job");
                }
                return;
            }
        }

        let Some(handler) = self.registry.lookup(&handler_name) else {
            warn!(job_id = %job_id, handler = %handler_name, "no handler registered");
            if let Err(e) = self.queue.fail(&job_id, "no handler registered", false).await {
                error!(job_id = %job_id, error = %e, "failed to mark job as failed");
            }
            return;
        };

        let job_cancel = shutdown.child_token();
        let reporter = ProgressReporter::new(self.queue.clone(), job_id.clone(), job_cancel.clone());

        debug!(job_id = %job_id, handler = %handler_name, worker_id = %self.id, "executing job");
        let result = handler.run(job_cancel.clone(), job, reporter).await;

        match result {
            Ok(outcome) => {
                if let Some(cp) = &outcome.checkpoint {
                    if let Err(e) = self.queue.save_checkpoint(&job_id, cp).await {
                        warn!(job_id = %job_id, error = %e, "final checkpoint write failed");
                    }
                }
                info!(job_id = %job_id, handler = %handler_name, cost = outcome.cost_actual, "job completed");
                if let Err(e) = self.queue.complete(&job_id, outcome.cost_actual).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as completed");
                }
            }
            Err(failure) => {
                let interrupted = job_cancel.is_cancelled() || self.is_paused(&job_id).await;
                if interrupted {
                    // Not a failure: persist the checkpoint and hand the job
                    // back for the next boot or the resume.
                    info!(job_id = %job_id, handler = %handler_name, "job interrupted, checkpointing");
                    if let Err(e) = self
                        .queue
                        .release(&job_id, failure.checkpoint.as_deref())
                        .await
                    {
                        error!(job_id = %job_id, error = %e, "failed to release job");
                    }
                } else {
                    warn!(
                        job_id = %job_id,
                        handler = %handler_name,
                        error = %failure.message,
                        retryable = failure.retryable,
                        "job failed"
                    );
                    if let Some(cp) = &failure.checkpoint {
                        if let Err(e) = self.queue.save_checkpoint(&job_id, cp).await {
                            warn!(job_id = %job_id, error = %e, "checkpoint write failed");
                        }
                    }
                    if let Err(e) = self
                        .queue
                        .fail(&job_id, &failure.message, failure.retryable)
                        .await
                    {
                        error!(job_id = %job_id, error = %e, "failed to mark job as failed");
                    }
                }
            }
        }
    }

    async fn is_paused(&self, job_id: &str) -> bool {
        matches!(
            self.queue.get(job_id).await.map(|j| j.status),
            Ok(JobStatus::Paused)
        )
    }
}
