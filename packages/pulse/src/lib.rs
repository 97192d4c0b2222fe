//! Pulse - the asynchronous compute subsystem of QNTX.
//!
//! Pulse turns the durable store into a job system:
//! - [`Job`] / [`JobQueue`] - durable queue with at-most-once dispatch,
//!   visible progress, and checkpointed retries
//! - [`HandlerRegistry`] - explicit name-to-handler mapping
//! - [`BudgetLedger`] - daily/monthly spend admission
//! - [`WorkerPool`] - N workers leasing jobs under a shared cancellation
//!   signal
//! - [`Ticker`] - recurring schedules materialized into queued jobs
//! - [`Pulse`] - the lifecycle supervisor tying the above together
//!
//! # Architecture
//!
//! ```text
//! caller ──Enqueue──▶ jobs table ◀──tick── Ticker (schedules)
//!                        │
//!                 WorkerPool lease
//!                        │
//!          Budget.admit ─┤─ Registry.lookup
//!                        │
//!                  handler.run(cancel, job, reporter)
//!                        │
//!            Complete / Fail / checkpoint + requeue
//! ```

mod budget;
mod config;
mod error;
mod job;
mod queue;
mod registry;
mod schedule;
mod scheduler;
mod supervisor;
pub mod testing;
mod worker;

pub use budget::{Admission, BudgetLedger, BudgetWindow};
pub use config::Config;
pub use error::PulseError;
pub use job::{Job, JobStatus};
pub use queue::{JobQueue, OrphanReport};
pub use registry::{
    HandlerFailure, HandlerOutcome, HandlerRegistry, HandlerResult, JobHandler, ProgressReporter,
};
pub use schedule::{Cadence, CalendarSpec, Field, Schedule};
pub use scheduler::{Ticker, TickerConfig};
pub use supervisor::Pulse;
pub use worker::{WorkerPool, WorkerPoolConfig};
