//! Typed storage errors.
//!
//! Variants map to distinct handling strategies in callers:
//! - `Migration` / `Database` are system-level faults and abort the enclosing
//!   operation unchanged.
//! - `NotFound` / `EmptySubjects` are caller mistakes and never retried.
//! - `CapEnforcement` means an eviction pass failed mid-transaction; the
//!   insert was rolled back and the graph is unchanged.

use crate::events::EventType;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A versioned migration failed to apply. The store file is unchanged.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// No attestation with the given id.
    #[error("attestation {0} not found")]
    NotFound(String),

    /// Attestations must carry at least one subject.
    #[error("attestation must have at least one subject")]
    EmptySubjects,

    /// A bounded-storage eviction pass failed. The enclosing transaction was
    /// rolled back, so the triggering insert did not happen either.
    #[error("{cap} enforcement failed for {key} (count {count}): {source}")]
    CapEnforcement {
        cap: EventType,
        key: String,
        count: i64,
        #[source]
        source: sqlx::Error,
    },

    /// Any other database failure, propagated verbatim.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}
