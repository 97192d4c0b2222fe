//! Soft storage warnings.
//!
//! An advisory view over (actor, context) pairs that are at 50% or more of
//! the hard cap: how fast the pair is growing and roughly when it will hit
//! the limit. Computed outside the enforcement transaction; purely
//! informational.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::bounded::PAIR_COUNT_SQL;
use crate::error::StoreError;

/// Week rates below this are treated as noise and produce no warning.
const MIN_WEEK_RATE_PER_HOUR: f64 = 0.01;

/// Day rate must exceed the week rate by this factor before an acceleration
/// is reported.
const ACCELERATION_THRESHOLD: f64 = 1.5;

#[derive(Debug, Clone, Serialize)]
pub struct StorageWarning {
    pub current: i64,
    pub limit: i64,
    pub actor: String,
    pub context: String,
    /// Creation rate over the last day, per hour.
    pub rate_per_hour: f64,
    /// Day rate over week rate, present when the pair is accelerating.
    pub acceleration_factor: Option<f64>,
    /// Projection from the day rate; absent when the pair is idle.
    pub time_until_full: Option<Duration>,
}

const PAIR_COUNT_SINCE_SQL: &str = r#"
    SELECT COUNT(*)
    FROM attestations a
    WHERE EXISTS (SELECT 1 FROM json_each(a.actors) WHERE json_each.value = ?1)
      AND EXISTS (SELECT 1 FROM json_each(a.contexts) WHERE json_each.value = ?2)
      AND json_extract(a.actors, '$[0]') IS NOT a.id
      AND a.timestamp >= ?3
"#;

/// Evaluate one (actor, context) pair against the cap.
pub(crate) async fn check_pair(
    pool: &SqlitePool,
    actor: &str,
    context: &str,
    limit: i64,
) -> Result<Option<StorageWarning>, StoreError> {
    let current: i64 = sqlx::query_scalar(PAIR_COUNT_SQL)
        .bind(actor)
        .bind(context)
        .fetch_one(pool)
        .await?;

    // Only pairs in the [50%, 100%) band are worth flagging.
    if current * 2 < limit || current >= limit {
        return Ok(None);
    }

    let now = Utc::now();
    let day_count = count_since(pool, actor, context, now - Duration::hours(24)).await?;
    let week_count = count_since(pool, actor, context, now - Duration::days(7)).await?;

    let week_rate = week_count as f64 / (24.0 * 7.0);
    if week_rate < MIN_WEEK_RATE_PER_HOUR {
        return Ok(None);
    }

    let day_rate = day_count as f64 / 24.0;
    let acceleration_factor = if day_rate > ACCELERATION_THRESHOLD * week_rate {
        Some(day_rate / week_rate)
    } else {
        None
    };

    let time_until_full = if day_rate > 0.0 {
        let hours = (limit - current) as f64 / day_rate;
        Some(Duration::seconds((hours * 3600.0) as i64))
    } else {
        None
    };

    Ok(Some(StorageWarning {
        current,
        limit,
        actor: actor.to_string(),
        context: context.to_string(),
        rate_per_hour: day_rate,
        acceleration_factor,
        time_until_full,
    }))
}

async fn count_since(
    pool: &SqlitePool,
    actor: &str,
    context: &str,
    cutoff: DateTime<Utc>,
) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar(PAIR_COUNT_SINCE_SQL)
        .bind(actor)
        .bind(context)
        .bind(cutoff)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
