//! SQLite store with versioned migrations.
//!
//! The [`Store`] exclusively owns the database file; every other component
//! borrows the pool. WAL mode gives concurrent readers with serialized
//! writers, which is the concurrency contract the queue and the bounded
//! store rely on.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::error::StoreError;

/// Embedded versioned migrations, applied in order at open time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Handle to the QNTX database file.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path`.
    ///
    /// Migrations are not run automatically; call [`Store::migrate`] before
    /// handing the pool to other components.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Open an in-memory database for tests.
    ///
    /// The pool is pinned to a single long-lived connection; a second
    /// connection would see a different empty database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Apply pending migrations, in order.
    ///
    /// Idempotent; a failed migration leaves the store unchanged and returns
    /// [`StoreError::Migration`].
    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Borrow the connection pool. This is the query surface for every other
    /// component; all writes serialize through SQLite's write lock.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Drain the pool. Called last at shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
