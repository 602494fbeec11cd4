//! Projection store backed by SQLite.
//!
//! This module provides SQLite-based storage for:
//! - Stream cursors and the block hash history used for reorg walk-back
//! - Raw event records
//! - ERC20 and NFT balances, chart buckets and NFT metadata
//! - The contribution journals that make every write idempotent and revertible
//!
//! # Architecture
//!
//! - `models`: Row types returned by queries
//! - `repository`: Range commits, rollbacks and read queries
//! - Connection pooling with SQLite WAL mode for concurrency
//! - Migration system for schema versioning

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::TrackerError;

pub mod models;
pub mod repository;

pub use repository::{CommitBatch, Repository};

/// Tables the indexer cannot run without.
const REQUIRED_TABLES: &[&str] = &[
    "cursors",
    "block_history",
    "events",
    "erc20_balances",
    "nft_balances",
    "balance_deltas",
    "chart_buckets",
    "chart_contributions",
    "nft_metadata",
];

/// Creates a SQLite connection pool, runs migrations and verifies the schema.
///
/// # Configuration
///
/// - **WAL mode**: Enables concurrent readers during writes
/// - **Busy timeout**: 30 seconds to handle lock contention between streams
/// - **Max connections**: 5, or 1 for `:memory:` databases so every query
///   sees the same in-memory database
///
/// # Errors
///
/// Returns a database error if the URL is invalid, the connection fails or a
/// migration cannot be applied.
///
/// # Example
///
/// ```no_run
/// use eth_event_indexer::db::create_pool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = create_pool("sqlite:./eventindexer.db").await?;
///     Ok(())
/// }
/// ```
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, TrackerError> {
    info!(database_url, "Connecting to database");

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| {
            TrackerError::database(
                format!("Failed to parse database URL: {database_url}"),
                Some(Box::new(e)),
            )
        })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true);

    let in_memory = database_url.contains(":memory:");
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5).min_connections(1)
    };

    let pool = pool_options
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await
        .map_err(|e| {
            TrackerError::database(
                format!("Failed to connect to database at {database_url}"),
                Some(Box::new(e)),
            )
        })?;

    info!("Running database migrations");
    run_migrations(&pool).await?;
    verify_database(&pool).await?;
    info!("Database migrations complete");

    Ok(pool)
}

/// Runs database migrations from the `migrations/` directory.
///
/// Applied migrations are recorded, so this is safe to call repeatedly.
///
/// # Errors
///
/// Returns a database error if a migration fails.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), TrackerError> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        TrackerError::database("Failed to run database migrations", Some(Box::new(e)))
    })?;

    Ok(())
}

/// Verify that required tables exist after migrations.
///
/// # Errors
///
/// Returns a database error naming the first missing table.
pub async fn verify_database(pool: &SqlitePool) -> Result<(), TrackerError> {
    let rows = sqlx::query_as::<_, (String,)>("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(pool)
        .await
        .map_err(|e| {
            TrackerError::database("Failed to verify database schema", Some(Box::new(e)))
        })?;

    for table in REQUIRED_TABLES {
        if !rows.iter().any(|(name,)| name == table) {
            return Err(TrackerError::database(
                format!("Database schema incomplete: table '{table}' is missing"),
                None,
            ));
        }
    }

    Ok(())
}
