//! Lifecycle supervisor.
//!
//! Startup order: open store, migrate, build queue, recover orphans, start
//! the worker pool, start the scheduler. Shutdown cancels the shared token,
//! waits for every task bounded by the configured deadline, then closes the
//! store last. Jobs still running at the deadline stay `running` and are
//! reclaimed by orphan recovery on the next boot.

use std::sync::Arc;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use qntx_store::Store;

use crate::budget::BudgetLedger;
use crate::config::Config;
use crate::error::PulseError;
use crate::queue::JobQueue;
use crate::registry::HandlerRegistry;
use crate::scheduler::{Ticker, TickerConfig};
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// A running Pulse subsystem. Owns the store for its lifetime; dropping
/// without [`Pulse::shutdown`] abandons in-flight jobs to orphan recovery.
pub struct Pulse {
    store: Store,
    queue: JobQueue,
    boot_id: String,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    deadline: std::time::Duration,
}

impl Pulse {
    /// Bring the subsystem up in order and return the running handle.
    pub async fn start(
        store: Store,
        registry: HandlerRegistry,
        config: Config,
    ) -> Result<Self, PulseError> {
        store.migrate().await?;

        let boot_id = format!("boot-{}", Uuid::new_v4().simple());
        let queue = JobQueue::new(store.pool().clone(), config.max_attempts);

        let report = queue.recover_orphans(&boot_id).await?;
        if report.requeued > 0 || report.failed > 0 {
            info!(
                requeued = report.requeued,
                failed = report.failed,
                "orphan jobs recovered"
            );
        }

        let budget = Arc::new(BudgetLedger::new(
            store.pool().clone(),
            config.daily_budget_usd,
            config.monthly_budget_usd,
        ));
        let registry = Arc::new(registry);
        let shutdown = CancellationToken::new();

        let pool = WorkerPool::new(
            queue.clone(),
            registry,
            budget,
            WorkerPoolConfig {
                workers: config.workers,
                poll_interval: config.poll_interval,
                boot_id: boot_id.clone(),
            },
        );
        let mut handles = pool.spawn(shutdown.clone());

        let ticker = Ticker::new(
            queue.clone(),
            TickerConfig {
                interval: config.scheduler_interval,
            },
        );
        handles.push(tokio::spawn(ticker.run(shutdown.clone())));

        info!(boot_id = %boot_id, workers = config.workers, "pulse started");

        Ok(Self {
            store,
            queue,
            boot_id,
            shutdown,
            handles,
            deadline: config.shutdown_deadline,
        })
    }

    /// The queue, for enqueueing and inspecting jobs while running.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn boot_id(&self) -> &str {
        &self.boot_id
    }

    /// A child of the shared shutdown signal, for embedding callers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Graceful shutdown: stop leasing, let in-flight handlers checkpoint,
    /// join everything bounded by the deadline, close the store last.
    pub async fn shutdown(self) {
        info!("pulse shutting down");
        self.shutdown.cancel();

        if tokio::time::timeout(self.deadline, join_all(self.handles))
            .await
            .is_err()
        {
            warn!("shutdown deadline exceeded; in-flight jobs left for orphan recovery");
        }

        self.store.close().await;
        info!("pulse stopped");
    }
}
