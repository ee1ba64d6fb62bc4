//! Cached search results for a query.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::matcher::MatchJob;
use crate::storage::match_cache::MatchCache;
use crate::{AppError, AppResult};

use super::state::SharedState;
use super::blocking;

#[derive(Deserialize)]
pub struct SearchParams {
    query_id: Option<String>,
    user_email: Option<String>,
}

/// GET /api/search?query_id=…&user_email=…
///
/// Returns the cached rows in their fixed order with scores normalised
/// to [0, 1]. An empty cache populates synchronously first; the
/// caller's view is recorded either way.
pub async fn search(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<serde_json::Value>> {
    let query_id = params
        .query_id
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::Validation("query_id".into()))?
        .trim()
        .parse::<i64>()
        .map_err(|_| AppError::Validation("query_id must be an integer".into()))?;
    let user_email = params.user_email.unwrap_or_default().trim().to_string();

    let results = blocking(move || {
        let mut results = state.db.with(|conn| MatchCache::results_for(conn, query_id))?;

        if results.is_empty() {
            tracing::info!(query_id, "Cache empty, populating now");
            let matcher = state.matcher.clone();
            let db = state.db.clone();
            state.queue.run_sync(MatchJob::RematchQuery(query_id), move || {
                // A collapsed predecessor may have filled the cache
                // while this call waited for the key.
                let already = db.with(|conn| MatchCache::results_for(conn, query_id))?;
                if already.is_empty() {
                    matcher.populate_query(query_id)?;
                }
                Ok(())
            })?;
            results = state.db.with(|conn| MatchCache::results_for(conn, query_id))?;
            tracing::info!(query_id, count = results.len(), "Cache populated");
        }

        if !user_email.is_empty() {
            state.db.with(|conn| MatchCache::record_view(conn, &user_email, query_id))?;
        }

        Ok(results)
    })
    .await?;

    let response: Vec<serde_json::Value> = results
        .iter()
        .map(|row| {
            serde_json::json!({
                "id": row.post_id,
                "relevance_score": row.score / 100.0,
            })
        })
        .collect();

    Ok(Json(serde_json::Value::Array(response)))
}
