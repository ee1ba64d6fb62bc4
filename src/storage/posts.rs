//! Post persistence.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::post::{NewPost, Post, PostParent, PostView, TEMPLATE_PROFILE};
use crate::{AppError, AppResult};

use super::database::{from_sql, now, to_sql};

pub struct PostStore;

// ── Row mapping ──

fn post_from_row(row: &Row) -> rusqlite::Result<Post> {
    let created_str: String = row.get("created_at")?;
    let last_match_str: Option<String> = row.get("last_match_added_at")?;
    let parent_raw: Option<i64> = row.get("parent_id")?;

    Ok(Post {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        parent: PostParent::from_db(parent_raw),
        title: row.get("title")?,
        summary: row.get("summary")?,
        body: row.get("body")?,
        template_name: row.get("template_name")?,
        timezone: row.get("timezone")?,
        location_tag: row.get("location_tag")?,
        ai_generated: row.get::<_, i64>("ai_generated")? != 0,
        image_url: row.get("image_url")?,
        clip_offset_x: row.get("clip_offset_x")?,
        clip_offset_y: row.get("clip_offset_y")?,
        rev: row.get("rev")?,
        has_new_matches: row.get::<_, i64>("has_new_matches")? != 0,
        last_match_added_at: last_match_str.and_then(|s| from_sql(&s).ok()),
        created_at: from_sql(&created_str)
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn view_from_row(row: &Row) -> rusqlite::Result<PostView> {
    Ok(PostView {
        post: post_from_row(row)?,
        author_name: row.get("author_name")?,
        author_email: row.get("author_email")?,
        placeholder_title: row.get("placeholder_title")?,
        placeholder_summary: row.get("placeholder_summary")?,
        placeholder_body: row.get("placeholder_body")?,
        child_count: row.get("child_count")?,
    })
}

const VIEW_SELECT: &str = "
    SELECT p.*,
           COALESCE(u.name, u.email) AS author_name,
           u.email AS author_email,
           t.placeholder_title, t.placeholder_summary, t.placeholder_body,
           (SELECT COUNT(*) FROM posts c WHERE c.parent_id = p.id) AS child_count
    FROM posts p
    LEFT JOIN users u ON p.user_id = u.id
    LEFT JOIN templates t ON p.template_name = t.name
";

// ── CRUD ──

impl PostStore {
    /// Insert a post and bump the author's activity timestamp.
    pub fn insert(conn: &Connection, post: &NewPost) -> AppResult<i64> {
        let created = to_sql(&now());
        conn.execute(
            "INSERT INTO posts (
                user_id, parent_id, title, summary, body, image_url,
                timezone, location_tag, ai_generated, template_name, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                post.user_id,
                post.parent.to_db(),
                post.title,
                post.summary,
                post.body,
                post.image_url,
                post.timezone,
                post.location_tag,
                post.ai_generated as i64,
                post.template_name,
                created,
            ],
        )?;
        let post_id = conn.last_insert_rowid();

        conn.execute(
            "UPDATE users SET last_activity = ?1 WHERE id = ?2",
            params![to_sql(&now()), post.user_id],
        )?;

        Ok(post_id)
    }

    /// Update content fields and bump the revision token.
    pub fn update_content(
        conn: &Connection,
        post_id: i64,
        title: &str,
        summary: &str,
        body: &str,
        image_url: Option<&str>,
        clip_offset_x: Option<f64>,
        clip_offset_y: Option<f64>,
    ) -> AppResult<bool> {
        let changed = conn.execute(
            "UPDATE posts SET
                title = ?1, summary = ?2, body = ?3, image_url = ?4,
                clip_offset_x = COALESCE(?5, clip_offset_x),
                clip_offset_y = COALESCE(?6, clip_offset_y),
                rev = rev + 1
             WHERE id = ?7",
            params![title, summary, body, image_url, clip_offset_x, clip_offset_y, post_id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(conn: &Connection, post_id: i64) -> AppResult<bool> {
        let deleted = conn.execute("DELETE FROM posts WHERE id = ?1", params![post_id])?;
        Ok(deleted > 0)
    }

    pub fn get(conn: &Connection, post_id: i64) -> AppResult<Option<Post>> {
        let post = conn
            .query_row("SELECT * FROM posts WHERE id = ?1", params![post_id], post_from_row)
            .optional()?;
        Ok(post)
    }

    /// Post with author, template placeholders and child count.
    pub fn get_view(conn: &Connection, post_id: i64) -> AppResult<Option<PostView>> {
        let view = conn
            .query_row(&format!("{} WHERE p.id = ?1", VIEW_SELECT), params![post_id], view_from_row)
            .optional()?;
        Ok(view)
    }

    pub fn by_template(conn: &Connection, template_name: &str) -> AppResult<Vec<Post>> {
        let mut stmt = conn.prepare("SELECT * FROM posts WHERE template_name = ?1")?;
        let posts = stmt
            .query_map(params![template_name], post_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    pub fn recent(conn: &Connection, template_name: &str, limit: usize) -> AppResult<Vec<PostView>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE p.template_name = ?1 ORDER BY p.created_at DESC LIMIT ?2",
            VIEW_SELECT
        ))?;
        let posts = stmt
            .query_map(params![template_name, limit as i64], view_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    /// The user's single profile post, if created.
    pub fn profile_of(conn: &Connection, user_id: i64) -> AppResult<Option<Post>> {
        let post = conn
            .query_row(
                "SELECT * FROM posts WHERE user_id = ?1 AND template_name = ?2",
                params![user_id, TEMPLATE_PROFILE],
                post_from_row,
            )
            .optional()?;
        Ok(post)
    }

    /// Auto-create the profile post from the template placeholders.
    pub fn create_profile(conn: &Connection, user_id: i64, display_name: &str) -> AppResult<i64> {
        if Self::profile_of(conn, user_id)?.is_some() {
            return Err(AppError::Validation("profile already exists".into()));
        }
        let (summary, body): (String, String) = conn
            .query_row(
                "SELECT placeholder_summary, placeholder_body FROM templates WHERE name = ?1",
                params![TEMPLATE_PROFILE],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .unwrap_or_default();

        let new_post = NewPost {
            user_id,
            parent: PostParent::Profile,
            title: display_name.to_string(),
            summary,
            body,
            template_name: TEMPLATE_PROFILE.to_string(),
            timezone: "UTC".to_string(),
            location_tag: None,
            ai_generated: false,
            image_url: None,
        };
        Self::insert(conn, &new_post)
    }

    /// Current revision token, or None if the post is gone.
    pub fn rev_of(conn: &Connection, post_id: i64) -> AppResult<Option<i64>> {
        let rev = conn
            .query_row("SELECT rev FROM posts WHERE id = ?1", params![post_id], |r| r.get(0))
            .optional()?;
        Ok(rev)
    }

    pub fn set_last_match_added(conn: &Connection, query_id: i64) -> AppResult<()> {
        conn.execute(
            "UPDATE posts SET last_match_added_at = ?1, has_new_matches = 1 WHERE id = ?2",
            params![to_sql(&now()), query_id],
        )?;
        Ok(())
    }

    /// Posts (template `post`) created after `since` by someone other
    /// than `exclude_email`.
    pub fn count_posts_since(conn: &Connection, since: &str, exclude_email: &str) -> AppResult<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM posts p
             JOIN users u ON p.user_id = u.id
             WHERE p.template_name = 'post' AND p.created_at > ?1 AND u.email != ?2",
            params![since, exclude_email],
            |r| r.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrations;
    use crate::storage::users::{NewUser, UserStore};
    use crate::post::{TEMPLATE_POST, TEMPLATE_QUERY};

    fn setup() -> (Connection, i64) {
        let conn = Connection::open_in_memory().unwrap();
        migrations::migrate(&conn).unwrap();
        let user_id = UserStore::insert(&conn, &NewUser::for_email("ada@example.com")).unwrap();
        (conn, user_id)
    }

    fn sample(user_id: i64, title: &str, template: &str) -> NewPost {
        NewPost {
            user_id,
            parent: PostParent::Root,
            title: title.to_string(),
            summary: "summary".to_string(),
            body: "body".to_string(),
            template_name: template.to_string(),
            timezone: "UTC".to_string(),
            location_tag: None,
            ai_generated: false,
            image_url: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (conn, user_id) = setup();
        let id = PostStore::insert(&conn, &sample(user_id, "hello", TEMPLATE_POST)).unwrap();
        let post = PostStore::get(&conn, id).unwrap().unwrap();
        assert_eq!(post.title, "hello");
        assert_eq!(post.parent, PostParent::Root);
        assert_eq!(post.rev, 0);
        assert!(!post.is_query());
    }

    #[test]
    fn test_update_bumps_rev() {
        let (conn, user_id) = setup();
        let id = PostStore::insert(&conn, &sample(user_id, "v1", TEMPLATE_POST)).unwrap();
        PostStore::update_content(&conn, id, "v2", "s", "b", None, None, None).unwrap();
        let post = PostStore::get(&conn, id).unwrap().unwrap();
        assert_eq!(post.title, "v2");
        assert_eq!(post.rev, 1);
    }

    #[test]
    fn test_clip_offsets_survive_plain_update() {
        let (conn, user_id) = setup();
        let id = PostStore::insert(&conn, &sample(user_id, "p", TEMPLATE_POST)).unwrap();
        PostStore::update_content(&conn, id, "p", "s", "b", None, Some(0.5), Some(-0.25)).unwrap();
        PostStore::update_content(&conn, id, "p2", "s", "b", None, None, None).unwrap();
        let post = PostStore::get(&conn, id).unwrap().unwrap();
        assert_eq!(post.clip_offset_x, Some(0.5));
        assert_eq!(post.clip_offset_y, Some(-0.25));
    }

    #[test]
    fn test_view_carries_author_and_placeholders() {
        let (conn, user_id) = setup();
        let id = PostStore::insert(&conn, &sample(user_id, "p", TEMPLATE_POST)).unwrap();
        let view = PostStore::get_view(&conn, id).unwrap().unwrap();
        assert_eq!(view.author_email.as_deref(), Some("ada@example.com"));
        assert!(view.placeholder_title.is_some());
        assert_eq!(view.child_count, 0);
    }

    #[test]
    fn test_profile_auto_create_is_single() {
        let (conn, user_id) = setup();
        let id = PostStore::create_profile(&conn, user_id, "Ada").unwrap();
        let profile = PostStore::profile_of(&conn, user_id).unwrap().unwrap();
        assert_eq!(profile.id, id);
        assert_eq!(profile.parent, PostParent::Profile);
        assert!(PostStore::create_profile(&conn, user_id, "Ada").is_err());
    }

    #[test]
    fn test_by_template_filters() {
        let (conn, user_id) = setup();
        PostStore::insert(&conn, &sample(user_id, "a", TEMPLATE_POST)).unwrap();
        PostStore::insert(&conn, &sample(user_id, "q", TEMPLATE_QUERY)).unwrap();
        let queries = PostStore::by_template(&conn, TEMPLATE_QUERY).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].title, "q");
    }

    #[test]
    fn test_delete() {
        let (conn, user_id) = setup();
        let id = PostStore::insert(&conn, &sample(user_id, "p", TEMPLATE_POST)).unwrap();
        assert!(PostStore::delete(&conn, id).unwrap());
        assert!(!PostStore::delete(&conn, id).unwrap());
        assert!(PostStore::get(&conn, id).unwrap().is_none());
    }
}
