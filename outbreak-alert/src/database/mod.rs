//! SQLite persistence with sqlx.
//!
//! The delivery store is small and write-bursty: one record per dispatch,
//! then a stream of single-row callback updates. The pool is opened in WAL
//! mode so lookups keep working while a save holds the write lock.

pub mod models;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Pool settings for the delivery store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreDbOptions {
    pub max_connections: u32,
    /// How long SQLite itself waits on a held lock before reporting busy.
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for StoreDbOptions {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl StoreDbOptions {
    /// Defaults for `database_url`. In-memory databases exist per connection,
    /// so they get exactly one.
    pub fn for_url(database_url: &str) -> Self {
        let mut options = Self::default();
        if is_memory_url(database_url) {
            options.max_connections = 1;
        }
        options
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

/// Open a pool with explicit options.
pub async fn open_pool(database_url: &str, options: StoreDbOptions) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(options.busy_timeout)
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(options.acquire_timeout)
        .connect_with(connect_options)
        .await?;

    let mode = journal_mode(&pool).await?;
    info!(
        journal_mode = %mode,
        max_connections = options.max_connections,
        "Delivery store database opened"
    );
    Ok(pool)
}

/// Open a pool with defaults for `database_url`.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    open_pool(database_url, StoreDbOptions::for_url(database_url)).await
}

/// Effective journal mode (`wal` for files, `memory` for in-memory databases).
pub async fn journal_mode(pool: &DbPool) -> Result<String, sqlx::Error> {
    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(pool).await?;
    Ok(mode.to_ascii_lowercase())
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Delivery store migrations applied");
    Ok(())
}
