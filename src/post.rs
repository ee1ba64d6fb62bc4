//! Post domain types.
//!
//! Three template tags are reserved and drive engine behaviour: `post`
//! (regular content, fanned out against queries), `query` (a standing
//! interest with a cached result set) and `profile` (a user's single
//! self-describing post).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TEMPLATE_POST: &str = "post";
pub const TEMPLATE_PROFILE: &str = "profile";
pub const TEMPLATE_QUERY: &str = "query";

/// Where a post hangs in the tree.
///
/// The database keeps the legacy encoding (-1 = profile, NULL = root,
/// anything else = concrete parent id); in memory the tag is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostParent {
    /// The author's profile post itself (stored as -1).
    Profile,
    /// A top-level post with no parent.
    Root,
    /// A child of the given post.
    Child(i64),
}

impl PostParent {
    pub fn from_db(raw: Option<i64>) -> Self {
        match raw {
            Some(-1) => PostParent::Profile,
            Some(id) => PostParent::Child(id),
            None => PostParent::Root,
        }
    }

    pub fn to_db(self) -> Option<i64> {
        match self {
            PostParent::Profile => Some(-1),
            PostParent::Root => None,
            PostParent::Child(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub user_id: i64,
    pub parent: PostParent,
    pub title: String,
    pub summary: String,
    pub body: String,
    pub template_name: String,
    pub timezone: String,
    pub location_tag: Option<String>,
    pub ai_generated: bool,
    pub image_url: Option<String>,
    pub clip_offset_x: Option<f64>,
    pub clip_offset_y: Option<f64>,
    /// Version token, bumped on every content update. The matcher
    /// captures it at the start of a run and skips its upserts if a
    /// newer revision has been committed since.
    pub rev: i64,
    pub has_new_matches: bool,
    pub last_match_added_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Post {
    pub fn is_query(&self) -> bool {
        self.template_name == TEMPLATE_QUERY
    }

    pub fn is_profile(&self) -> bool {
        self.template_name == TEMPLATE_PROFILE
    }
}

/// Validated input for inserting a post.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub user_id: i64,
    pub parent: PostParent,
    pub title: String,
    pub summary: String,
    pub body: String,
    pub template_name: String,
    pub timezone: String,
    pub location_tag: Option<String>,
    pub ai_generated: bool,
    pub image_url: Option<String>,
}

/// A post joined with presentation data (author, template placeholders,
/// child count) as returned by the read endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PostView {
    #[serde(flatten)]
    pub post: Post,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub placeholder_title: Option<String>,
    pub placeholder_summary: Option<String>,
    pub placeholder_body: Option<String>,
    pub child_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_roundtrip() {
        assert_eq!(PostParent::from_db(Some(-1)), PostParent::Profile);
        assert_eq!(PostParent::from_db(None), PostParent::Root);
        assert_eq!(PostParent::from_db(Some(7)), PostParent::Child(7));

        assert_eq!(PostParent::Profile.to_db(), Some(-1));
        assert_eq!(PostParent::Root.to_db(), None);
        assert_eq!(PostParent::Child(7).to_db(), Some(7));
    }
}
