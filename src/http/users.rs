//! Profile and member-listing endpoints.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::post::PostView;
use crate::storage::posts::PostStore;
use crate::storage::users::UserStore;
use crate::user::proximity;
use crate::{AppError, AppResult};

use super::forms::FormData;
use super::state::SharedState;
use super::{blocking, success_with};

/// GET /api/users/{email}/profile
///
/// The profile post is auto-created from the `profile` template on
/// first fetch.
pub async fn get_profile(
    State(state): State<SharedState>,
    Path(email): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let view = blocking(move || {
        state.db.with(|conn| {
            let user = UserStore::by_email(conn, &email)?
                .ok_or_else(|| AppError::NotFound(format!("user {}", email)))?;

            let profile_id = match PostStore::profile_of(conn, user.id)? {
                Some(profile) => profile.id,
                None => {
                    let id = PostStore::create_profile(conn, user.id, user.display_name())?;
                    tracing::info!(user_id = user.id, post_id = id, "Profile post auto-created");
                    id
                }
            };

            PostStore::get_view(conn, profile_id)?
                .ok_or_else(|| AppError::Storage("profile not readable".into()))
        })
    })
    .await?;

    Ok(success_with("post", view))
}

/// POST /api/users/profile/update
///
/// The first update that lands marks the profile complete and
/// broadcasts the new member.
pub async fn update_profile(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> AppResult<Json<serde_json::Value>> {
    let form = FormData::read(multipart).await?;
    let view = blocking(move || update_profile_inner(&state, form)).await?;
    Ok(success_with("post", view))
}

fn update_profile_inner(state: &SharedState, form: FormData) -> AppResult<PostView> {
    let email = form.required("email")?;
    let title = form.required("title")?;
    let summary = form.required("summary")?;
    let body = form.required("body")?;

    let (user_id, profile_id, newly_complete, view) = state.db.with(|conn| {
        let user = UserStore::by_email(conn, &email)?
            .ok_or_else(|| AppError::NotFound(format!("user {}", email)))?;

        let profile_id = match PostStore::profile_of(conn, user.id)? {
            Some(profile) => profile.id,
            None => PostStore::create_profile(conn, user.id, user.display_name())?,
        };

        PostStore::update_content(conn, profile_id, &title, &summary, &body, None, None, None)?;
        // The profile title doubles as the display name.
        UserStore::set_name(conn, user.id, &title)?;
        let newly_complete = UserStore::set_profile_complete(conn, user.id)?;

        let view = PostStore::get_view(conn, profile_id)?
            .ok_or_else(|| AppError::Storage("profile not readable".into()))?;
        Ok((user.id, profile_id, newly_complete, view))
    })?;

    if let Err(e) = state.embeddings.put(profile_id, &title, &summary, &body) {
        tracing::warn!(post_id = profile_id, error = %e, "Profile embedding failed");
    }

    if newly_complete {
        tracing::info!(user_id, "Profile completed");
        state.notifier.spawn_new_member(user_id);
    }

    Ok(view)
}

#[derive(Deserialize)]
pub struct RecentUsersParams {
    user_email: Option<String>,
}

/// GET /api/users/recent — members with complete profiles, invite-chain
/// proximity to the caller first, then recency.
pub async fn recent_users(
    State(state): State<SharedState>,
    Query(params): Query<RecentUsersParams>,
) -> AppResult<Json<serde_json::Value>> {
    let caller_email = params.user_email.unwrap_or_default();

    let users = blocking(move || {
        state.db.with(|conn| {
            let caller_chain = if caller_email.is_empty() {
                Vec::new()
            } else {
                UserStore::by_email(conn, &caller_email)?
                    .map(|u| u.ancestor_chain)
                    .unwrap_or_default()
            };

            let mut users: Vec<_> = UserStore::all_complete(conn)?
                .into_iter()
                .map(|user| {
                    let prox = proximity(&caller_chain, &user.ancestor_chain);
                    (prox, user)
                })
                .collect();

            users.sort_by(|(prox_a, a), (prox_b, b)| {
                prox_a
                    .cmp(prox_b)
                    .then_with(|| b.last_activity.cmp(&a.last_activity))
            });

            Ok(users
                .into_iter()
                .map(|(prox, user)| {
                    serde_json::json!({
                        "id": user.id,
                        "name": user.display_name(),
                        "email": user.email,
                        "proximity": prox,
                        "last_activity": user.last_activity,
                    })
                })
                .collect::<Vec<_>>())
        })
    })
    .await?;

    Ok(Json(serde_json::json!({"status": "success", "users": users})))
}
