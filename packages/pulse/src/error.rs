//! Typed errors for the Pulse subsystem.

use crate::budget::BudgetWindow;
use crate::job::JobStatus;
use qntx_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    /// Enqueue of an id that already exists.
    #[error("job {0} already exists")]
    DuplicateJob(String),

    /// No job or schedule with the given id.
    #[error("{0} not found")]
    NotFound(String),

    /// A status change the state machine does not allow.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// `handler_name` has no registration. Terminal for the job.
    #[error("no handler registered for {0}")]
    HandlerMissing(String),

    /// Admission failed; the job stays queued and is re-evaluated on the
    /// next lease cycle.
    #[error("budget rejected ({window}): projected {projected:.2} over limit {limit:.2}")]
    BudgetRejected {
        window: BudgetWindow,
        projected: f64,
        limit: f64,
    },

    /// A cadence string that does not parse.
    #[error("invalid cadence: {0}")]
    InvalidCadence(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
