//! Durable storage for the QNTX attestation graph.
//!
//! This crate owns the SQLite file and everything persisted in it:
//! - [`Store`] - pool management and versioned migrations
//! - [`asid`] - structured 32-character identifiers for attestations and jobs
//! - [`Attestation`] - the immutable claim record
//! - [`BoundedStore`] - insertion under hard per-key caps with eviction telemetry
//! - [`StorageEvent`] / [`StorageWarning`] - enforcement telemetry and advisories
//!
//! Higher layers (the Pulse compute subsystem, ingesters, the CLI) borrow the
//! pool from [`Store`] and issue their own queries; the schema itself is
//! defined here so there is exactly one owner of the file format.

pub mod asid;
mod attestation;
mod bounded;
mod error;
mod events;
mod store;
mod warnings;

pub use attestation::Attestation;
pub use bounded::{BoundedLimits, BoundedStore};
pub use error::StoreError;
pub use events::{EventType, StorageEvent};
pub use store::Store;
pub use warnings::StorageWarning;
