//! Device registration, query badges and the unified poll endpoint.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::storage::database::{from_sql, to_sql};
use crate::storage::match_cache::MatchCache;
use crate::storage::posts::PostStore;
use crate::storage::users::UserStore;
use crate::{AppError, AppResult};

use super::state::SharedState;
use super::blocking;

#[derive(Deserialize)]
pub struct RegisterDeviceRequest {
    device_id: Option<String>,
    apns_token: Option<String>,
}

/// POST /api/notifications/register-device
pub async fn register_device(
    State(state): State<SharedState>,
    Json(request): Json<RegisterDeviceRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let device_id = request
        .device_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("device_id".into()))?;
    let apns_token = request
        .apns_token
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("apns_token".into()))?;

    blocking(move || {
        state.db.with(|conn| {
            let user = UserStore::by_device_id(conn, &device_id)?
                .ok_or_else(|| AppError::NotFound("user for device".into()))?;
            UserStore::set_apns_token(conn, user.id, &apns_token)?;
            tracing::info!(user_id = user.id, "Push token registered");
            Ok(())
        })
    })
    .await?;

    Ok(Json(serde_json::json!({"status": "success"})))
}

#[derive(Deserialize)]
pub struct BadgesRequest {
    user_email: Option<String>,
    #[serde(default)]
    query_ids: Vec<i64>,
}

/// POST /api/queries/badges — bulk dirty flags, string-keyed for JSON.
pub async fn badges(
    State(state): State<SharedState>,
    Json(request): Json<BadgesRequest>,
) -> AppResult<Json<HashMap<String, bool>>> {
    let user_email = request
        .user_email
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Validation("user_email".into()))?;
    let query_ids = request.query_ids;

    let flags = blocking(move || {
        state.db.with(|conn| MatchCache::new_matches_bulk(conn, &user_email, &query_ids))
    })
    .await?;

    Ok(Json(flags.into_iter().map(|(id, dirty)| (id.to_string(), dirty)).collect()))
}

#[derive(Deserialize)]
pub struct PollRequest {
    user_email: Option<String>,
    #[serde(default)]
    query_ids: Vec<i64>,
    last_viewed_users: Option<String>,
    last_viewed_posts: Option<String>,
}

/// POST /api/notifications/poll — one round-trip for every badge the
/// client renders.
pub async fn poll(
    State(state): State<SharedState>,
    Json(request): Json<PollRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let user_email = request.user_email.unwrap_or_default();
    let query_ids = request.query_ids;
    // Client timestamps are normalised through the storage format so
    // the SQL string comparison is sound.
    let viewed_users = request.last_viewed_users.as_deref().and_then(normalize_ts);
    let viewed_posts = request.last_viewed_posts.as_deref().and_then(normalize_ts);

    let response = blocking(move || {
        state.db.with(|conn| {
            let query_badges: HashMap<String, bool> = if !user_email.is_empty() && !query_ids.is_empty() {
                MatchCache::new_matches_bulk(conn, &user_email, &query_ids)?
                    .into_iter()
                    .map(|(id, dirty)| (id.to_string(), dirty))
                    .collect()
            } else {
                HashMap::new()
            };

            let has_new_users = match &viewed_users {
                Some(ts) => UserStore::count_completed_since(conn, ts)? > 0,
                None => false,
            };

            let has_new_posts = match (&viewed_posts, user_email.is_empty()) {
                (Some(ts), false) => PostStore::count_posts_since(conn, ts, &user_email)? > 0,
                _ => false,
            };

            Ok(serde_json::json!({
                "query_badges": query_badges,
                "has_new_users": has_new_users,
                "has_new_posts": has_new_posts,
            }))
        })
    })
    .await?;

    Ok(Json(response))
}

fn normalize_ts(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    from_sql(raw).ok().map(|dt| to_sql(&dt))
}
