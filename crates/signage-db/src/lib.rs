//! SQLite connection pooling and schema migrations shared by every store
//! in the signage control plane.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, PoolError, PoolSettings};

pub use rusqlite;
