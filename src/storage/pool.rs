//! Bounded SQLite connection pool.
//!
//! Connections to the single database file are checked out one per
//! operation and returned on every path via the guard's `Drop`. A
//! connection whose operation failed with a storage error is closed and
//! replaced instead of being reused; the pool lazily opens a fresh one
//! on the next acquire.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use rusqlite::Connection;

use crate::constants::POOL_ACQUIRE_TIMEOUT_SECS;
use crate::{AppError, AppResult};

use super::database::open_connection;

struct PoolInner {
    idle: VecDeque<Connection>,
    /// Connections currently existing (idle + checked out).
    open: usize,
}

pub struct DbPool {
    inner: Mutex<PoolInner>,
    available: Condvar,
    path: PathBuf,
    max_connections: usize,
}

/// Checkout guard. Returns the connection to the pool on drop unless the
/// operation it served failed, in which case the connection is closed.
struct PooledConn<'a> {
    conn: Option<Connection>,
    pool: &'a DbPool,
    broken: bool,
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        let conn = self.conn.take();
        let mut inner = match self.pool.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        };
        if self.broken {
            // Drop the connection entirely; the open count frees a slot
            // for a fresh one.
            inner.open -= 1;
            tracing::warn!("Discarding pooled connection after storage error");
        } else if let Some(conn) = conn {
            inner.idle.push_back(conn);
        }
        drop(inner);
        self.pool.available.notify_one();
    }
}

impl DbPool {
    /// Open the pool, eagerly validating one connection.
    pub fn open(path: &Path, max_connections: usize) -> AppResult<Self> {
        let first = open_connection(path)?;
        let mut idle = VecDeque::with_capacity(max_connections);
        idle.push_back(first);

        Ok(Self {
            inner: Mutex::new(PoolInner { idle, open: 1 }),
            available: Condvar::new(),
            path: path.to_path_buf(),
            max_connections: max_connections.max(1),
        })
    }

    /// Run `f` on a pooled connection. On a storage error the connection
    /// is not returned to the pool.
    pub fn with<T>(&self, f: impl FnOnce(&mut Connection) -> AppResult<T>) -> AppResult<T> {
        let mut guard = self.acquire()?;
        let conn = guard.conn.as_mut().expect("guard always holds a connection");
        let result = f(conn);
        if matches!(result, Err(AppError::Storage(_))) {
            guard.broken = true;
        }
        result
    }

    fn acquire(&self) -> AppResult<PooledConn<'_>> {
        let deadline = Duration::from_secs(POOL_ACQUIRE_TIMEOUT_SECS);
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| AppError::Storage(format!("Pool lock poisoned: {}", e)))?;

        loop {
            if let Some(conn) = inner.idle.pop_front() {
                return Ok(PooledConn { conn: Some(conn), pool: self, broken: false });
            }
            if inner.open < self.max_connections {
                inner.open += 1;
                drop(inner);
                match open_connection(&self.path) {
                    Ok(conn) => {
                        return Ok(PooledConn { conn: Some(conn), pool: self, broken: false })
                    }
                    Err(e) => {
                        // Roll the slot back so a later acquire can retry.
                        if let Ok(mut inner) = self.inner.lock() {
                            inner.open -= 1;
                        }
                        self.available.notify_one();
                        return Err(e);
                    }
                }
            }

            let (guard, timeout) = self
                .available
                .wait_timeout(inner, deadline)
                .map_err(|e| AppError::Storage(format!("Pool lock poisoned: {}", e)))?;
            inner = guard;
            if timeout.timed_out() && inner.idle.is_empty() && inner.open >= self.max_connections {
                return Err(AppError::Storage("Timed out waiting for a database connection".into()));
            }
        }
    }

    /// Pool statistics for the health endpoint.
    pub fn stats(&self) -> (usize, usize) {
        match self.inner.lock() {
            Ok(inner) => (inner.idle.len(), inner.open),
            Err(_) => (0, 0),
        }
    }
}
