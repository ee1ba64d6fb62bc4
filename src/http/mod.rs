//! HTTP surface: JSON over HTTP with the `{status, message}` envelope.
//!
//! Handlers stay thin: parse and validate at the edge, then run the
//! core synchronously on the blocking pool. Blocking work finishes even
//! if the client disconnects, so cache-warming is never lost.

pub mod error;
pub mod forms;
pub mod notifications;
pub mod posts;
pub mod search;
pub mod state;
pub mod users;

use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::{AppError, AppResult};

pub use state::{AppState, SharedState};

/// Max accepted request body (uploads included).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Per-request timeout. Matcher work runs on the blocking pool and is
/// not cancelled by this.
const REQUEST_TIMEOUT_SECS: u64 = 60;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/health", get(health))
        .route("/api/posts/create", post(posts::create))
        .route("/api/posts/update", post(posts::update))
        .route("/api/posts/recent", get(posts::recent))
        .route("/api/posts/{id}", get(posts::get).delete(posts::delete))
        .route("/api/search", get(search::search))
        .route("/api/queries/badges", post(notifications::badges))
        .route("/api/notifications/poll", post(notifications::poll))
        .route("/api/notifications/register-device", post(notifications::register_device))
        .route("/api/users/recent", get(users::recent_users))
        .route("/api/users/{email}/profile", get(users::get_profile))
        .route("/api/users/profile/update", post(users::update_profile))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Run a synchronous core operation on the blocking pool.
pub(crate) async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> AppResult<T> + Send + 'static,
) -> AppResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Storage(format!("Blocking task failed: {}", e)))?
}

/// `{"status": "success", "<key>": <value>}`
pub(crate) fn success_with<T: Serialize>(key: &str, value: T) -> Json<serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("status".into(), "success".into());
    map.insert(key.into(), serde_json::to_value(value).unwrap_or(serde_json::Value::Null));
    Json(serde_json::Value::Object(map))
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "success", "message": "pong"}))
}

async fn health(State(state): State<SharedState>) -> AppResult<Json<serde_json::Value>> {
    let (db_ok, idle, open) = blocking(move || {
        let ok = state
            .db
            .with(|conn| crate::storage::database::quick_check(conn))
            .is_ok();
        let (idle, open) = state.db.pool_stats();
        Ok((ok, idle, open))
    })
    .await?;

    Ok(Json(serde_json::json!({
        "status": if db_ok { "success" } else { "error" },
        "database": db_ok,
        "pool": {"idle": idle, "open": open},
    })))
}
