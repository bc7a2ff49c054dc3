//! IO for the SQLite-backed persistence layer.
//!
//! Handles connecting, running migrations, and exposing a pooled handle the
//! engine drives every mutating operation through inside one transaction.

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;

use crate::error::Result;

/// Run all pending migrations against the database at `path`, creating it
/// (and its schema) if it does not yet exist.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if absent) the SQLite database at `path` and run
    /// migrations. Single-writer by design: the pool is capped at one
    /// connection so every caller serializes through the same handle,
    /// matching the concurrency model of the store.
    pub async fn connect(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::util::create_dir(parent)?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Trace);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(Duration::from_secs(3600))
            .connect_with(opts)
            .await?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Open an in-memory database, used by tests.
    pub async fn connect_in_memory() -> Result<Self> {
        let opts: SqliteConnectOptions = "sqlite::memory:".parse::<SqliteConnectOptions>()?.foreign_keys(true);
        let pool = SqlitePoolOptions::new().min_connections(1).max_connections(1).connect_with(opts).await?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>> {
        self.pool.begin().await.map_err(Into::into)
    }
}
