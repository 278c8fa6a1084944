//! Shared SQLite connection pooling for the durable backends.
//!
//! [`crate::queue::SqliteWorkQueue`] and [`crate::process::SqliteProcessStore`]
//! can share one pool so queue messages and process records live in the
//! same database file.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default pool size for SQLite connection pool.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Configuration for the SQLite connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
    /// Idle timeout for connections.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            min_idle: Some(1),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Opens (creating if missing) a WAL-mode database file.
pub async fn connect(db_path: impl AsRef<Path>, config: &PoolConfig) -> Result<SqlitePool, sqlx::Error> {
    let db_path = db_path.as_ref().to_string_lossy().to_string();
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

    build_pool(options, config).await
}

/// Opens a private in-memory database.
///
/// The pool is limited to a single connection: every connection to
/// `sqlite::memory:` would otherwise see its own empty database.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let config = PoolConfig {
        max_size: 1,
        min_idle: Some(1),
        idle_timeout: None,
        ..PoolConfig::default()
    };
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?
        .journal_mode(SqliteJournalMode::Memory)
        .synchronous(SqliteSynchronous::Normal);

    build_pool(options, &config).await
}

async fn build_pool(options: SqliteConnectOptions, config: &PoolConfig) -> Result<SqlitePool, sqlx::Error> {
    let mut builder = SqlitePoolOptions::new()
        .max_connections(config.max_size)
        .acquire_timeout(config.connection_timeout);

    if let Some(min_idle) = config.min_idle {
        builder = builder.min_connections(min_idle);
    }

    // An in-memory database disappears with its last connection.
    builder = builder.idle_timeout(config.idle_timeout).max_lifetime(None);

    builder.connect_with(options).await
}
