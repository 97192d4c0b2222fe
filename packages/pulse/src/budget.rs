//! Budget admission.
//!
//! Budgets are monetary, not temporal: the ledger sums `cost_actual` over
//! jobs completed in the current calendar day and month and admits a job iff
//! both sums plus the job's `cost_estimate` stay under their limits. Windows
//! use local wall-clock boundaries. Nothing is materialized; both sums are
//! computed on demand.

use chrono::{DateTime, Datelike, Local, TimeZone, Utc};
use sqlx::SqlitePool;

use crate::error::PulseError;
use crate::job::Job;

/// Which budget window rejected a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetWindow {
    Day,
    Month,
}

impl std::fmt::Display for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetWindow::Day => f.write_str("daily"),
            BudgetWindow::Month => f.write_str("monthly"),
        }
    }
}

/// Admission verdict. Rejection is non-terminal: the job stays queued and is
/// re-evaluated on the next lease cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Rejected {
        window: BudgetWindow,
        projected: f64,
        limit: f64,
    },
}

#[derive(Clone)]
pub struct BudgetLedger {
    pool: SqlitePool,
    daily_budget_usd: Option<f64>,
    monthly_budget_usd: Option<f64>,
}

impl BudgetLedger {
    /// `None` budgets are unbounded.
    pub fn new(
        pool: SqlitePool,
        daily_budget_usd: Option<f64>,
        monthly_budget_usd: Option<f64>,
    ) -> Self {
        Self {
            pool,
            daily_budget_usd,
            monthly_budget_usd,
        }
    }

    /// Decide whether `job` may run right now.
    pub async fn admit(&self, job: &Job) -> Result<Admission, PulseError> {
        if self.daily_budget_usd.is_none() && self.monthly_budget_usd.is_none() {
            return Ok(Admission::Admitted);
        }

        let now = Local::now();

        if let Some(limit) = self.daily_budget_usd {
            let spent = self.spent_since(day_start(now)).await?;
            let projected = spent + job.cost_estimate;
            if projected > limit {
                return Ok(Admission::Rejected {
                    window: BudgetWindow::Day,
                    projected,
                    limit,
                });
            }
        }

        if let Some(limit) = self.monthly_budget_usd {
            let spent = self.spent_since(month_start(now)).await?;
            let projected = spent + job.cost_estimate;
            if projected > limit {
                return Ok(Admission::Rejected {
                    window: BudgetWindow::Month,
                    projected,
                    limit,
                });
            }
        }

        Ok(Admission::Admitted)
    }

    /// Sum of `cost_actual` over jobs completed at or after `cutoff`.
    pub async fn spent_since(&self, cutoff: DateTime<Utc>) -> Result<f64, PulseError> {
        let spent: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT SUM(cost_actual)
            FROM jobs
            WHERE status = 'completed' AND completed_at >= ?
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(spent.unwrap_or(0.0))
    }
}

/// Local midnight of the current day, as UTC.
fn day_start(now: DateTime<Local>) -> DateTime<Utc> {
    local_boundary(now, now.year(), now.month(), now.day())
}

/// Local midnight of the first of the current month, as UTC.
fn month_start(now: DateTime<Local>) -> DateTime<Utc> {
    local_boundary(now, now.year(), now.month(), 1)
}

fn local_boundary(now: DateTime<Local>, year: i32, month: u32, day: u32) -> DateTime<Utc> {
    match Local.with_ymd_and_hms(year, month, day, 0, 0, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.with_timezone(&Utc)
        }
        // Midnight skipped by a DST jump; fall back to the UTC reading.
        chrono::LocalResult::None => now
            .with_timezone(&Utc)
            .date_naive()
            .and_time(chrono::NaiveTime::MIN)
            .and_utc(),
    }
}
