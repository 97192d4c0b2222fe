//! Environment-backed configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use qntx_store::BoundedLimits;

/// Pulse and bounded-storage configuration loaded from environment
/// variables. Every knob has a default; only the database path is commonly
/// set.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,
    pub limits: BoundedLimits,
    pub workers: usize,
    pub poll_interval: Duration,
    pub max_attempts: i64,
    /// Unset budgets are unbounded.
    pub daily_budget_usd: Option<f64>,
    pub monthly_budget_usd: Option<f64>,
    pub scheduler_interval: Duration,
    pub shutdown_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("qntx.db"),
            limits: BoundedLimits::default(),
            workers: 1,
            poll_interval: Duration::from_secs(1),
            max_attempts: 3,
            daily_budget_usd: None,
            monthly_budget_usd: None,
            scheduler_interval: Duration::from_secs(60),
            shutdown_deadline: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, reading `.env` first
    /// in development.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        let defaults = Config::default();

        Ok(Self {
            database_path: env::var("QNTX_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            limits: BoundedLimits {
                actor_context_limit: parse_or(
                    "QNTX_ACTOR_CONTEXT_LIMIT",
                    defaults.limits.actor_context_limit,
                )?,
                actor_contexts_limit: parse_or(
                    "QNTX_ACTOR_CONTEXTS_LIMIT",
                    defaults.limits.actor_contexts_limit,
                )?,
                entity_actors_limit: parse_or(
                    "QNTX_ENTITY_ACTORS_LIMIT",
                    defaults.limits.entity_actors_limit,
                )?,
            },
            workers: parse_or("PULSE_WORKERS", defaults.workers)?,
            poll_interval: Duration::from_millis(parse_or(
                "PULSE_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            max_attempts: parse_or("PULSE_MAX_ATTEMPTS", defaults.max_attempts)?,
            daily_budget_usd: parse_optional("PULSE_DAILY_BUDGET_USD")?,
            monthly_budget_usd: parse_optional("PULSE_MONTHLY_BUDGET_USD")?,
            scheduler_interval: Duration::from_secs(parse_or(
                "SCHEDULER_INTERVAL_SECS",
                defaults.scheduler_interval.as_secs(),
            )?),
            shutdown_deadline: Duration::from_secs(parse_or(
                "SHUTDOWN_DEADLINE_SECS",
                defaults.shutdown_deadline.as_secs(),
            )?),
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn parse_optional(key: &str) -> Result<Option<f64>> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.limits.actor_context_limit, 64);
        assert_eq!(config.workers, 1);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.max_attempts, 3);
        assert!(config.daily_budget_usd.is_none());
        assert!(config.monthly_budget_usd.is_none());
        assert_eq!(config.scheduler_interval, Duration::from_secs(60));
        assert_eq!(config.shutdown_deadline, Duration::from_secs(60));
    }
}
