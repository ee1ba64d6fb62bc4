//! Schema creation and additive migrations.
//!
//! Version 1 is the base schema. Later versions only add columns, each
//! guarded by a `pragma table_info` probe since SQLite has no
//! `ADD COLUMN IF NOT EXISTS`.

use rusqlite::Connection;

use crate::post::{TEMPLATE_POST, TEMPLATE_PROFILE, TEMPLATE_QUERY};
use crate::{AppError, AppResult};

use super::database::column_exists;

pub const CURRENT_SCHEMA_VERSION: u32 = 3;

pub fn get_schema_version(conn: &Connection) -> AppResult<u32> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |r| r.get(0),
        )
        .map_err(|e| AppError::Storage(e.to_string()))?;

    if !exists {
        return Ok(0);
    }

    let version: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))
        .map_err(|e| AppError::Storage(e.to_string()))?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
        rusqlite::params![version],
    )
    .map_err(|e| AppError::Storage(e.to_string()))?;
    Ok(())
}

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    name TEXT,
    device_ids TEXT NOT NULL DEFAULT '[]',
    apns_token TEXT,
    ancestor_chain TEXT NOT NULL DEFAULT '[]',
    invites_remaining INTEGER NOT NULL DEFAULT 5,
    profile_complete INTEGER NOT NULL DEFAULT 0,
    profile_completed_at TEXT,
    last_activity TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS templates (
    name TEXT PRIMARY KEY,
    placeholder_title TEXT NOT NULL DEFAULT '',
    placeholder_summary TEXT NOT NULL DEFAULT '',
    placeholder_body TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    parent_id INTEGER,
    title TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    image_url TEXT,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    location_tag TEXT,
    ai_generated INTEGER NOT NULL DEFAULT 0,
    template_name TEXT NOT NULL DEFAULT 'post',
    has_new_matches INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_posts_user ON posts(user_id);
CREATE INDEX IF NOT EXISTS idx_posts_template ON posts(template_name);
CREATE INDEX IF NOT EXISTS idx_posts_parent ON posts(parent_id);
CREATE INDEX IF NOT EXISTS idx_posts_created ON posts(created_at);

CREATE TABLE IF NOT EXISTS query_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    query_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
    post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
    relevance_score REAL NOT NULL,
    matched_at TEXT NOT NULL,
    UNIQUE(query_id, post_id)
);
CREATE INDEX IF NOT EXISTS idx_query_results_query ON query_results(query_id);
CREATE INDEX IF NOT EXISTS idx_query_results_post ON query_results(post_id);
CREATE INDEX IF NOT EXISTS idx_query_results_score ON query_results(query_id, relevance_score DESC);

CREATE TABLE IF NOT EXISTS query_views (
    query_id INTEGER NOT NULL,
    user_email TEXT NOT NULL,
    last_viewed_at TEXT NOT NULL,
    PRIMARY KEY (query_id, user_email)
);

CREATE TABLE IF NOT EXISTS search_cache (
    prompt_hash TEXT PRIMARY KEY,
    model_name TEXT NOT NULL,
    llm_results TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_search_cache_model ON search_cache(model_name);
";

/// Bring the database up to `CURRENT_SCHEMA_VERSION`.
pub fn migrate(conn: &Connection) -> AppResult<()> {
    let version = get_schema_version(conn)?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)
            .map_err(|e| AppError::Storage(format!("Schema v1 failed: {}", e)))?;
        set_schema_version(conn, 1)?;
        tracing::info!("Applied schema v1");
    }

    if version < 2 {
        add_column(conn, "posts", "clip_offset_x", "REAL")?;
        add_column(conn, "posts", "clip_offset_y", "REAL")?;
        set_schema_version(conn, 2)?;
        tracing::info!("Applied schema v2 (clip offsets)");
    }

    if version < 3 {
        add_column(conn, "posts", "last_match_added_at", "TEXT")?;
        add_column(conn, "posts", "rev", "INTEGER NOT NULL DEFAULT 0")?;
        set_schema_version(conn, 3)?;
        tracing::info!("Applied schema v3 (match freshness, revision token)");
    }

    seed_templates(conn)?;
    Ok(())
}

fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> AppResult<()> {
    if column_exists(conn, table, column)? {
        return Ok(());
    }
    conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl), [])
        .map_err(|e| AppError::Storage(format!("ALTER {}.{} failed: {}", table, column, e)))?;
    Ok(())
}

/// The reserved templates must always exist; their placeholders seed
/// auto-created profile posts.
fn seed_templates(conn: &Connection) -> AppResult<()> {
    let seeds = [
        (TEMPLATE_POST, "Title", "One-line summary", "What do you want to say?"),
        (TEMPLATE_PROFILE, "Your name", "A line about you", "Tell people about yourself"),
        (TEMPLATE_QUERY, "What are you looking for?", "One-line summary", "Describe it in detail"),
    ];
    for (name, title, summary, body) in seeds {
        conn.execute(
            "INSERT OR IGNORE INTO templates (name, placeholder_title, placeholder_summary, placeholder_body)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![name, title, summary, body],
        )
        .map_err(|e| AppError::Storage(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_from_empty() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);

        // Reserved templates seeded.
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM templates", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_additive_columns_present() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        for col in ["clip_offset_x", "clip_offset_y", "last_match_added_at", "rev"] {
            assert!(column_exists(&conn, "posts", col).unwrap(), "missing {}", col);
        }
    }
}
