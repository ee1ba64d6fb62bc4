//! SQLite connection setup and timestamp conventions.
//!
//! All timestamps are stored as fixed-width RFC 3339 UTC strings
//! (microsecond precision, `Z` suffix) so that SQL string comparison
//! orders them correctly. Columns compared against each other must all
//! be written through [`to_sql`].

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::constants::SQLITE_BUSY_TIMEOUT_MS;
use crate::{AppError, AppResult};

/// Open a connection with the engine pragmas applied.
pub fn open_connection(path: &Path) -> AppResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)
        .map_err(|e| AppError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;

    tracing::debug!(path = %path.display(), "Database connection opened");

    configure(&conn)?;
    Ok(conn)
}

/// Pragmas applied to every connection:
/// - journal_mode = WAL
/// - synchronous = NORMAL
/// - foreign_keys = ON
/// - temp_store = MEMORY
/// - busy_timeout = SQLITE_BUSY_TIMEOUT_MS
fn configure(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA temp_store = MEMORY;",
    )
    .map_err(|e| AppError::Storage(format!("Failed to configure pragmas: {}", e)))?;
    conn.busy_timeout(std::time::Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS as u64))
        .map_err(|e| AppError::Storage(format!("Failed to set busy_timeout: {}", e)))?;
    Ok(())
}

/// Sanity probe used by the startup health check.
pub fn quick_check(conn: &Connection) -> AppResult<()> {
    let result: String = conn
        .query_row("PRAGMA quick_check", [], |r| r.get(0))
        .map_err(|e| AppError::Storage(format!("quick_check failed: {}", e)))?;
    if result != "ok" {
        return Err(AppError::Storage(format!("quick_check: {}", result)));
    }
    Ok(())
}

/// True if `table` already carries `column` (for additive migrations).
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage.
pub fn to_sql(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn from_sql(s: &str) -> AppResult<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .map_err(|e| AppError::Storage(format!("Bad timestamp {:?}: {}", s, e)))
}
