//! Recurring scheduler.
//!
//! The ticker periodically materializes due schedules into queued jobs.
//! Each tick is one transaction: select due rows, insert one job per
//! schedule, advance `next_run_at` past now. Ticks run sequentially on a
//! single task, so a slow tick delays the next one instead of overlapping
//! it, and missed windows collapse to a single run per schedule.

use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use qntx_store::asid::{self, AsidInput, IdPrefix};

use crate::error::PulseError;
use crate::job::Job;
use crate::queue::JobQueue;
use crate::schedule::Schedule;

#[derive(Debug, Clone)]
pub struct TickerConfig {
    /// Wall-clock tick period.
    pub interval: Duration,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

pub struct Ticker {
    queue: JobQueue,
    config: TickerConfig,
}

impl Ticker {
    pub fn new(queue: JobQueue, config: TickerConfig) -> Self {
        Self { queue, config }
    }

    /// Run until shutdown. The first tick fires immediately so overdue
    /// schedules are caught up at startup.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.config.interval.as_secs(), "scheduler starting");

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(0) => {}
                Ok(enqueued) => info!(enqueued, "scheduler tick enqueued jobs"),
                Err(e) => error!(error = %e, "scheduler tick failed"),
            }
        }

        info!("scheduler stopped");
    }

    /// One scan: enqueue a job for every due schedule and advance it.
    pub async fn tick(&self) -> Result<u64, PulseError> {
        let now = Utc::now();
        let mut tx = self.queue.pool().begin().await?;

        let due = Schedule::due(&mut *tx, now).await?;
        let mut enqueued = 0;

        for schedule in due {
            // Mint a collision-checked job id inside the transaction.
            let input = AsidInput {
                subject: &schedule.handler_name,
                predicate: "run",
                context: &schedule.id,
                actor: &schedule.actor,
            };
            let mut job_id = asid::generate(IdPrefix::Job, &input);
            for _ in 0..9 {
                let taken: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = ?")
                    .bind(&job_id)
                    .fetch_optional(&mut *tx)
                    .await?;
                if taken.is_none() {
                    break;
                }
                job_id = asid::generate(IdPrefix::Job, &input);
            }

            let job = Job::builder()
                .id(job_id)
                .handler_name(schedule.handler_name.clone())
                .source(format!("schedule:{}", schedule.id))
                .payload(schedule.payload_template.clone())
                .actor(schedule.actor.clone())
                .created_at(now)
                .build();
            JobQueue::insert_row(&mut *tx, &job).await?;

            let next_run_at = schedule.cadence.next_after(schedule.next_run_at, now);
            sqlx::query("UPDATE schedules SET last_run_at = ?, next_run_at = ? WHERE id = ?")
                .bind(now)
                .bind(next_run_at)
                .bind(&schedule.id)
                .execute(&mut *tx)
                .await?;

            debug!(
                schedule_id = %schedule.id,
                job_id = %job.id,
                next_run_at = %next_run_at,
                "schedule materialized"
            );
            enqueued += 1;
        }

        tx.commit().await?;
        Ok(enqueued)
    }
}
