//! Post mutation and read endpoints.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::matcher::MatchJob;
use crate::post::{NewPost, PostParent, PostView, TEMPLATE_POST, TEMPLATE_PROFILE, TEMPLATE_QUERY};
use crate::storage::match_cache::MatchCache;
use crate::storage::posts::PostStore;
use crate::storage::users::UserStore;
use crate::{AppError, AppResult};

use super::forms::{save_image, FormData};
use super::state::SharedState;
use super::{blocking, success_with};

/// POST /api/posts/create
pub async fn create(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> AppResult<Json<serde_json::Value>> {
    let form = FormData::read(multipart).await?;
    let view = blocking(move || create_inner(&state, form)).await?;
    Ok(success_with("post", view))
}

fn create_inner(state: &SharedState, form: FormData) -> AppResult<PostView> {
    let email = form.required("email")?;
    let title = form.required("title")?;
    let summary = form.required("summary")?;
    let body = form.required("body")?;
    let timezone = form.optional("timezone").unwrap_or_else(|| "UTC".to_string());
    let template_name = form.optional("template_name").unwrap_or_else(|| TEMPLATE_POST.to_string());
    let explicit_parent = form.optional_i64("parent_id")?;

    let image_url = match &form.image {
        Some(image) => Some(save_image(&state.config.upload_dir, image)?),
        None => None,
    };

    let (post_id, view) = state.db.with(|conn| {
        let user = UserStore::by_email(conn, &email)?
            .ok_or_else(|| AppError::NotFound(format!("user {}", email)))?;

        // The profile invariant: one per user, parent tagged Profile.
        let parent = if template_name == TEMPLATE_PROFILE {
            if PostStore::profile_of(conn, user.id)?.is_some() {
                return Err(AppError::Validation("profile already exists".into()));
            }
            PostParent::Profile
        } else {
            match explicit_parent {
                Some(id) => PostParent::Child(id),
                // Default under the author's profile when one exists.
                None => match PostStore::profile_of(conn, user.id)? {
                    Some(profile) => PostParent::Child(profile.id),
                    None => PostParent::Root,
                },
            }
        };

        let post_id = PostStore::insert(
            conn,
            &NewPost {
                user_id: user.id,
                parent,
                title: title.clone(),
                summary: summary.clone(),
                body: body.clone(),
                template_name: template_name.clone(),
                timezone: timezone.clone(),
                location_tag: form.optional("location_tag"),
                ai_generated: form.bool_flag("ai_generated"),
                image_url: image_url.clone(),
            },
        )?;
        let view = PostStore::get_view(conn, post_id)?
            .ok_or_else(|| AppError::Storage("created post not readable".into()))?;
        Ok((post_id, view))
    })?;

    tracing::info!(post_id, template = %template_name, "Post created");

    // Embedding failure is non-fatal: the post stays, the matcher skips
    // this round and can regenerate on demand later.
    if let Err(e) = state.embeddings.put(post_id, &title, &summary, &body) {
        tracing::warn!(post_id, error = %e, "Embedding generation failed");
    }

    match template_name.as_str() {
        TEMPLATE_QUERY => {
            // Initial population runs on a worker; the descriptor
            // returns without waiting.
            state.queue.submit(MatchJob::RematchQuery(post_id));
        }
        TEMPLATE_POST => {
            state.queue.submit(MatchJob::RematchPost(post_id));
            state.notifier.spawn_new_post(post_id);
        }
        _ => {}
    }

    Ok(view)
}

/// POST /api/posts/update
pub async fn update(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> AppResult<Json<serde_json::Value>> {
    let form = FormData::read(multipart).await?;
    let view = blocking(move || update_inner(&state, form)).await?;
    Ok(success_with("post", view))
}

fn update_inner(state: &SharedState, form: FormData) -> AppResult<PostView> {
    let post_id = form
        .optional_i64("post_id")?
        .ok_or_else(|| AppError::Validation("post_id".into()))?;
    let email = form.required("email")?;
    let title = form.required("title")?;
    let summary = form.required("summary")?;
    let body = form.required("body")?;
    let clip_offset_x = form.optional_clip_offset("clip_offset_x")?;
    let clip_offset_y = form.optional_clip_offset("clip_offset_y")?;

    let new_image_url = match &form.image {
        Some(image) => Some(save_image(&state.config.upload_dir, image)?),
        None => None,
    };

    let (existing, view) = state.db.with(|conn| {
        let user = UserStore::by_email(conn, &email)?
            .ok_or_else(|| AppError::NotFound(format!("user {}", email)))?;
        let existing = PostStore::get(conn, post_id)?
            .ok_or_else(|| AppError::NotFound(format!("post {}", post_id)))?;
        if existing.user_id != user.id {
            return Err(AppError::Forbidden);
        }

        let image_url = new_image_url.clone().or_else(|| existing.image_url.clone());
        PostStore::update_content(
            conn,
            post_id,
            &title,
            &summary,
            &body,
            image_url.as_deref(),
            clip_offset_x,
            clip_offset_y,
        )?;

        let view = PostStore::get_view(conn, post_id)?
            .ok_or_else(|| AppError::Storage("updated post not readable".into()))?;
        Ok((existing, view))
    })?;

    tracing::info!(post_id, "Post updated");

    if let Err(e) = state.embeddings.put(post_id, &title, &summary, &body) {
        tracing::warn!(post_id, error = %e, "Embedding regeneration failed");
    }

    if existing.is_query() {
        // Stale results go first, then a fresh population under the
        // queue's key so concurrent runs collapse.
        state.db.with(|conn| MatchCache::clear_query(conn, post_id).map(|_| ()))?;
        let matcher = state.matcher.clone();
        state
            .queue
            .run_sync(MatchJob::RematchQuery(post_id), move || matcher.populate_query(post_id))?;
    } else {
        state.db.with(|conn| MatchCache::clear_post(conn, post_id).map(|_| ()))?;
        state.queue.submit(MatchJob::RematchPost(post_id));
    }

    Ok(state
        .db
        .with(|conn| PostStore::get_view(conn, post_id))?
        .unwrap_or(view))
}

/// DELETE /api/posts/{id}
pub async fn delete(
    State(state): State<SharedState>,
    Path(post_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let existed = blocking(move || state.matcher.delete_post(post_id)).await?;
    if !existed {
        return Err(AppError::NotFound(format!("post {}", post_id)));
    }
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": "Post deleted successfully"
    })))
}

/// GET /api/posts/{id}
pub async fn get(
    State(state): State<SharedState>,
    Path(post_id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let view = blocking(move || state.db.with(|conn| PostStore::get_view(conn, post_id))).await?;
    let view = view.ok_or_else(|| AppError::NotFound(format!("post {}", post_id)))?;
    Ok(success_with("post", view))
}

#[derive(Deserialize)]
pub struct RecentParams {
    limit: Option<usize>,
}

/// GET /api/posts/recent
pub async fn recent(
    State(state): State<SharedState>,
    Query(params): Query<RecentParams>,
) -> AppResult<Json<serde_json::Value>> {
    let limit = params.limit.unwrap_or(50).min(200);
    let posts = blocking(move || {
        state.db.with(|conn| PostStore::recent(conn, TEMPLATE_POST, limit))
    })
    .await?;
    let count = posts.len();
    Ok(Json(serde_json::json!({
        "status": "success",
        "posts": posts,
        "count": count,
    })))
}
