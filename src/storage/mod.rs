//! Persistence: SQLite schema, bounded connection pool and the typed
//! stores over it.

pub mod database;
pub mod match_cache;
pub mod migrations;
pub mod pool;
pub mod posts;
pub mod prompt_cache;
pub mod users;

use std::path::Path;

use crate::AppResult;

pub use pool::DbPool;

/// Handle to the database: the pool plus a migration entry point.
/// Stores are stateless; operations compose inside one [`Db::with`]
/// checkout.
pub struct Db {
    pool: DbPool,
}

impl Db {
    pub fn open(path: &Path, pool_size: usize) -> AppResult<Self> {
        let pool = DbPool::open(path, pool_size)?;
        Ok(Self { pool })
    }

    /// Open and bring the schema up to date.
    pub fn open_and_migrate(path: &Path, pool_size: usize) -> AppResult<Self> {
        let db = Self::open(path, pool_size)?;
        db.with(|conn| migrations::migrate(conn))?;
        Ok(db)
    }

    /// Run `f` on a pooled connection.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&mut rusqlite::Connection) -> AppResult<T>,
    ) -> AppResult<T> {
        self.pool.with(f)
    }

    pub fn pool_stats(&self) -> (usize, usize) {
        self.pool.stats()
    }
}
