//! Durable job queue over the QNTX store.
//!
//! The queue is a stateless facade over the jobs table; every transition is
//! a single row-level write, so exactly one transition can win per job. The
//! lease is one atomic UPDATE with an embedded FIFO subselect - SQLite's
//! serialized writer makes that an at-most-once claim.

use chrono::Utc;
use sqlx::{SqliteExecutor, SqlitePool};
use tracing::debug;

use crate::error::PulseError;
use crate::job::{Job, JobStatus};

const JOB_COLUMNS: &str = "id, handler_name, source, payload, status, progress_current, \
     progress_total, cost_estimate, cost_actual, actor, created_at, started_at, completed_at, \
     attempts, last_error, checkpoint, boot_id";

/// Outcome of orphan recovery at pool startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Jobs returned to the queue with their checkpoint intact.
    pub requeued: u64,
    /// Jobs whose attempts were exhausted, marked failed.
    pub failed: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    max_attempts: i64,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, max_attempts: i64) -> Self {
        Self { pool, max_attempts }
    }

    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a job row. Shared between [`JobQueue::enqueue`] and the
    /// scheduler, which inserts inside its own tick transaction.
    pub(crate) async fn insert_row<'e, E>(executor: E, job: &Job) -> Result<(), PulseError>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, handler_name, source, payload, status, progress_current,
                              progress_total, cost_estimate, cost_actual, actor, created_at,
                              started_at, completed_at, attempts, last_error, checkpoint, boot_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.handler_name)
        .bind(&job.source)
        .bind(&job.payload)
        .bind(job.status.as_str())
        .bind(job.progress_current)
        .bind(job.progress_total)
        .bind(job.cost_estimate)
        .bind(job.cost_actual)
        .bind(&job.actor)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.attempts)
        .bind(&job.last_error)
        .bind(&job.checkpoint)
        .bind(&job.boot_id)
        .execute(executor)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(PulseError::DuplicateJob(job.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new job in `queued`.
    pub async fn enqueue(&self, job: &Job) -> Result<(), PulseError> {
        Self::insert_row(&self.pool, job).await?;
        debug!(job_id = %job.id, handler = %job.handler_name, "job enqueued");
        Ok(())
    }

    /// Atomically claim the oldest queued job for `worker_id`.
    ///
    /// FIFO by `created_at`, ties broken by id. Sets `running`, stamps
    /// `started_at` and the boot id, and increments `attempts`.
    pub async fn lease(&self, worker_id: &str, boot_id: &str) -> Result<Option<Job>, PulseError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = ?,
                attempts = attempts + 1,
                boot_id = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(boot_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(ref job) = job {
            debug!(job_id = %job.id, worker_id, attempt = job.attempts, "job leased");
        }
        Ok(job)
    }

    /// Write progress (and optionally a checkpoint). Autocommit; callable
    /// while the job is running.
    pub async fn update_progress(
        &self,
        id: &str,
        current: i64,
        total: i64,
        checkpoint: Option<&[u8]>,
    ) -> Result<(), PulseError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress_current = ?,
                progress_total = ?,
                checkpoint = COALESCE(?, checkpoint)
            WHERE id = ?
            "#,
        )
        .bind(current)
        .bind(total)
        .bind(checkpoint)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PulseError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Persist a checkpoint without touching progress counters.
    pub async fn save_checkpoint(&self, id: &str, checkpoint: &[u8]) -> Result<(), PulseError> {
        let result = sqlx::query("UPDATE jobs SET checkpoint = ? WHERE id = ?")
            .bind(checkpoint)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(PulseError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    /// Transition `running` -> `completed` and record the actual cost.
    pub async fn complete(&self, id: &str, cost_actual: f64) -> Result<(), PulseError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', cost_actual = ?, completed_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(cost_actual)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let job = self.get(id).await?;
            return Err(PulseError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: JobStatus::Completed,
            });
        }
        Ok(())
    }

    /// Record a handler failure.
    ///
    /// Retryable failures requeue the job while attempts remain; anything
    /// else is terminal.
    pub async fn fail(&self, id: &str, error: &str, retryable: bool) -> Result<(), PulseError> {
        let job = self.get(id).await?;
        if job.status != JobStatus::Running {
            return Err(PulseError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to: JobStatus::Failed,
            });
        }

        if retryable && job.attempts < self.max_attempts {
            sqlx::query(
                "UPDATE jobs SET status = 'queued', last_error = ? WHERE id = ? AND status = 'running'",
            )
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
            debug!(job_id = %id, attempts = job.attempts, "job requeued after failure");
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed', last_error = ?, completed_at = ?
                WHERE id = ? AND status = 'running'
                "#,
            )
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
            debug!(job_id = %id, attempts = job.attempts, "job failed terminally");
        }
        Ok(())
    }

    /// Return a cancelled job to the queue, persisting its checkpoint.
    ///
    /// Cancellation is not a failure: attempts stay incremented and the
    /// checkpoint survives for the next lease. A job that was paused while
    /// running stays paused; only its checkpoint is written.
    pub async fn release(&self, id: &str, checkpoint: Option<&[u8]>) -> Result<(), PulseError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', checkpoint = COALESCE(?, checkpoint)
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(checkpoint)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            if let Some(cp) = checkpoint {
                self.save_checkpoint(id, cp).await?;
            }
        }
        Ok(())
    }

    /// Budget-rejection path: back to `queued` with the reason recorded and
    /// the lease's attempt increment undone, so rejection never counts as an
    /// attempt.
    pub async fn return_unbudgeted(&self, id: &str, reason: &str) -> Result<(), PulseError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', last_error = ?, attempts = attempts - 1
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pause a queued or running job. Pausing a paused job is a no-op;
    /// running jobs notice cooperatively at their next progress report.
    pub async fn pause(&self, id: &str) -> Result<(), PulseError> {
        let job = self.get(id).await?;
        match job.status {
            JobStatus::Paused => Ok(()),
            JobStatus::Queued | JobStatus::Running => {
                sqlx::query("UPDATE jobs SET status = 'paused' WHERE id = ? AND status = ?")
                    .bind(id)
                    .bind(job.status.as_str())
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            from => Err(PulseError::InvalidTransition {
                id: id.to_string(),
                from,
                to: JobStatus::Paused,
            }),
        }
    }

    /// Resume a paused job. Resuming a queued job is a no-op.
    pub async fn resume(&self, id: &str) -> Result<(), PulseError> {
        let job = self.get(id).await?;
        match job.status {
            JobStatus::Queued => Ok(()),
            JobStatus::Paused => {
                sqlx::query("UPDATE jobs SET status = 'queued' WHERE id = ? AND status = 'paused'")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            from => Err(PulseError::InvalidTransition {
                id: id.to_string(),
                from,
                to: JobStatus::Queued,
            }),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Job, PulseError> {
        sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PulseError::NotFound(format!("job {id}")))
    }

    /// List jobs, newest first, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<Job>, PulseError> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    /// Reclaim jobs left `running` by a previous boot. Runs exactly once per
    /// pool start, before any worker leases.
    ///
    /// Jobs with attempts remaining return to `queued` with their checkpoint
    /// intact; exhausted ones are marked failed as orphaned.
    pub async fn recover_orphans(&self, current_boot: &str) -> Result<OrphanReport, PulseError> {
        let mut tx = self.pool.begin().await?;

        let requeued = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', boot_id = NULL
            WHERE status = 'running'
              AND (boot_id IS NULL OR boot_id <> ?)
              AND attempts <= ?
            "#,
        )
        .bind(current_boot)
        .bind(self.max_attempts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let failed = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = 'orphaned', completed_at = ?
            WHERE status = 'running'
              AND (boot_id IS NULL OR boot_id <> ?)
            "#,
        )
        .bind(Utc::now())
        .bind(current_boot)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(OrphanReport { requeued, failed })
    }
}
