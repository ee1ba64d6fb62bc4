//! Durable match cache: `query_results`, `query_views` and the
//! dirty-flag computation.
//!
//! Read ordering is fixed here, in one SQL statement: newest post
//! first, then highest score. Handlers must not re-sort.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::AppResult;

use super::database::{from_sql, now, to_sql};

pub struct MatchCache;

/// One cached match as returned to the read path.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedMatch {
    pub post_id: i64,
    pub score: f64,
    pub matched_at: DateTime<Utc>,
}

impl MatchCache {
    /// Upsert one match. On conflict the score is replaced and
    /// `matched_at` bumped.
    pub fn upsert(conn: &Connection, query_id: i64, post_id: i64, score: f64) -> AppResult<()> {
        conn.execute(
            "INSERT INTO query_results (query_id, post_id, relevance_score, matched_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (query_id, post_id)
             DO UPDATE SET relevance_score = ?3, matched_at = ?4",
            params![query_id, post_id, score, to_sql(&now())],
        )?;
        Ok(())
    }

    /// Cached matches for a query, newest post first, then score.
    pub fn results_for(conn: &Connection, query_id: i64) -> AppResult<Vec<CachedMatch>> {
        let mut stmt = conn.prepare(
            "SELECT qr.post_id, qr.relevance_score, qr.matched_at
             FROM query_results qr
             JOIN posts p ON qr.post_id = p.id
             WHERE qr.query_id = ?1
             ORDER BY p.created_at DESC, qr.relevance_score DESC",
        )?;
        let rows = stmt
            .query_map(params![query_id], |row| {
                let matched_str: String = row.get(2)?;
                Ok(CachedMatch {
                    post_id: row.get(0)?,
                    score: row.get(1)?,
                    matched_at: from_sql(&matched_str).unwrap_or_else(|_| chrono::Utc::now()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Used when a query is edited or deleted.
    pub fn clear_query(conn: &Connection, query_id: i64) -> AppResult<usize> {
        let n = conn.execute("DELETE FROM query_results WHERE query_id = ?1", params![query_id])?;
        Ok(n)
    }

    /// Used when a post is edited or deleted.
    pub fn clear_post(conn: &Connection, post_id: i64) -> AppResult<usize> {
        let n = conn.execute("DELETE FROM query_results WHERE post_id = ?1", params![post_id])?;
        Ok(n)
    }

    /// Upsert the viewer's visit timestamp.
    pub fn record_view(conn: &Connection, user_email: &str, query_id: i64) -> AppResult<()> {
        let email = user_email.trim().to_lowercase();
        conn.execute(
            "INSERT INTO query_views (query_id, user_email, last_viewed_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (query_id, user_email)
             DO UPDATE SET last_viewed_at = ?3",
            params![query_id, email, to_sql(&now())],
        )?;
        Ok(())
    }

    /// One-round-trip dirty flags for a viewer over a set of queries:
    /// true iff a match landed after the viewer's last visit (a viewer
    /// who never visited sees any match as new).
    pub fn new_matches_bulk(
        conn: &Connection,
        user_email: &str,
        query_ids: &[i64],
    ) -> AppResult<HashMap<i64, bool>> {
        if query_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let email = user_email.trim().to_lowercase();

        let placeholders = query_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT p.id,
                    CASE
                        WHEN qv.last_viewed_at IS NULL THEN
                            p.last_match_added_at IS NOT NULL
                        ELSE
                            p.last_match_added_at > qv.last_viewed_at
                    END
             FROM posts p
             LEFT JOIN query_views qv
                 ON p.id = qv.query_id AND qv.user_email = ?1
             WHERE p.id IN ({})",
            placeholders
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&email];
        for id in query_ids {
            params.push(id);
        }

        let mut flags = HashMap::new();
        let mut rows = stmt.query(params.as_slice())?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let dirty: Option<bool> = row.get(1)?;
            flags.insert(id, dirty.unwrap_or(false));
        }
        Ok(flags)
    }
}
