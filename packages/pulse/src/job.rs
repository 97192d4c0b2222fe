//! Job model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

/// Lifecycle of a job row.
///
/// ```text
/// queued ──lease──▶ running ──complete──▶ completed
///   ▲                 │  │
///   │                 │  └─fail(retry)──┐
///   │                 │                 │
///   │                 ├─fail(final)────▶ failed
///   │                 └─pause──▶ paused
///   └──resume──────────────────  paused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the job can never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("unknown job status: {s}")),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// One scheduled unit of asynchronous work.
///
/// The payload is opaque bytes keyed by `handler_name`; handlers parse their
/// own shape. The checkpoint is handler-owned bytes written alongside
/// progress so a replayed job can resume instead of restarting.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    /// 32-character ASID with the `JB` prefix.
    pub id: String,

    pub handler_name: String,

    /// Origin identifier (CLI command, schedule id, ingester name).
    #[builder(default)]
    pub source: String,

    #[builder(default)]
    pub payload: Vec<u8>,

    #[sqlx(try_from = "String")]
    #[builder(default)]
    pub status: JobStatus,

    #[builder(default)]
    pub progress_current: i64,
    #[builder(default)]
    pub progress_total: i64,

    #[builder(default = 0.0)]
    pub cost_estimate: f64,
    #[builder(default = 0.0)]
    pub cost_actual: f64,

    #[builder(default)]
    pub actor: String,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default)]
    pub completed_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub attempts: i64,
    #[builder(default)]
    pub last_error: Option<String>,

    #[builder(default)]
    pub checkpoint: Option<Vec<u8>>,

    /// Boot marker stamped at lease time; a running job whose boot id is not
    /// the current one is an orphan.
    #[builder(default)]
    pub boot_id: Option<String>,
}

impl Job {
    /// Progress as a percentage; 0 when the total is unknown.
    pub fn percentage(&self) -> f64 {
        if self.progress_total <= 0 {
            0.0
        } else {
            self.progress_current as f64 / self.progress_total as f64 * 100.0
        }
    }
}
