//! Connection pool creation and configuration.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use thiserror::Error;

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// Runtime knobs for pool creation, populated from `[database]` in config.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_size: u32,
    pub busy_timeout_ms: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 8,
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),
}

/// Creates a new SQLite connection pool with WAL mode and foreign keys
/// enabled. Use `:memory:` for an in-memory database (tests only — each
/// pooled connection would otherwise see its own empty database, so
/// callers that need `:memory:` to behave like a shared database must cap
/// `max_size` at 1).
pub fn create_pool(db_path: &str, settings: PoolSettings) -> Result<DbPool, PoolError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let busy_timeout = settings.busy_timeout_ms;
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {busy_timeout};"
            ))
        });

    let max_size = if db_path == ":memory:" {
        1
    } else {
        settings.max_size
    };

    let pool = Pool::builder().max_size(max_size).build(manager)?;

    Ok(pool)
}
