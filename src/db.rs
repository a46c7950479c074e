//! Database connection and schema management.
//!
//! All durable engine state (task rows, dependency edges, upload handles,
//! the local metadata mirror) lives in one `SQLite` database. The
//! dispatcher commits batch transactions and the large upload worker
//! commits finalizations on the same file, so the database runs in WAL
//! mode: one writer at a time, readers never blocked behind it.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Connections shared by the dispatcher, the large upload worker and
/// producer threads. SQLite serializes writers regardless, so a handful
/// is plenty.
const POOL_SIZE: u32 = 5;

/// How long a connection waits on the writer lock before reporting busy.
/// Completion transactions are short; contention beyond this means a
/// wedged process rather than a busy one.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Could not open or connect to the task database.
    #[error("could not open task database: {0}")]
    Open(#[from] sqlx::Error),

    /// Task database schema migration failed.
    #[error("task database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Handle to the task database.
///
/// Wraps a small connection pool with WAL mode and the schema migrations
/// applied. Clones share the pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if necessary) the task database at `db_path`.
    ///
    /// WAL mode keeps task-state reads (batch selection, resume lookups)
    /// from stalling behind the completion transactions the dispatcher and
    /// the large upload worker commit.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] if the database cannot be opened, or
    /// [`DbError::Migrate`] if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// Capped at one connection: every in-memory connection would
    /// otherwise be its own empty database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Open`] if the connection fails, or
    /// [`DbError::Migrate`] if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Gracefully closes all connections in the pool.
    ///
    /// Should be called before the process exits; after calling this the
    /// `Database` instance must not be used.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
