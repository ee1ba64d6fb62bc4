//! Push-notification fan-out.
//!
//! On a new content post every token-holder except the author receives
//! exactly one notification: the "matched your query" form when one of
//! their queries clears the dense-similarity floor, the generic form
//! otherwise. Profile completion broadcasts a "new member" message.
//! Delivery failures are logged and never propagate.

pub mod push;

use std::sync::Arc;

use crate::constants::PUSH_MATCH_THRESHOLD;
use crate::embedding::{self, EmbeddingStore};
use crate::post::{TEMPLATE_POST, TEMPLATE_QUERY};
use crate::storage::posts::PostStore;
use crate::storage::users::UserStore;
use crate::storage::Db;
use crate::user::User;
use crate::AppResult;

pub use push::{DisabledPush, GatewayPush, PushSender};

pub struct Notifier {
    db: Arc<Db>,
    store: Arc<EmbeddingStore>,
    sender: Arc<dyn PushSender>,
}

impl Notifier {
    pub fn new(db: Arc<Db>, store: Arc<EmbeddingStore>, sender: Arc<dyn PushSender>) -> Self {
        Self { db, store, sender }
    }

    /// Fan out for a new post on a fire-once named thread.
    pub fn spawn_new_post(self: &Arc<Self>, post_id: i64) {
        let notifier = self.clone();
        std::thread::Builder::new()
            .name("push-fanout".into())
            .spawn(move || {
                if let Err(e) = notifier.notify_new_post(post_id) {
                    tracing::warn!(post_id, error = %e, "New-post fan-out failed");
                }
            })
            .ok();
    }

    /// Broadcast a profile completion on a fire-once named thread.
    pub fn spawn_new_member(self: &Arc<Self>, user_id: i64) {
        let notifier = self.clone();
        std::thread::Builder::new()
            .name("push-member".into())
            .spawn(move || {
                if let Err(e) = notifier.notify_new_member(user_id) {
                    tracing::warn!(user_id, error = %e, "New-member broadcast failed");
                }
            })
            .ok();
    }

    pub fn notify_new_post(&self, post_id: i64) -> AppResult<()> {
        let (post, author, recipients) = match self.db.with(|conn| {
            let post = PostStore::get(conn, post_id)?;
            let author = match &post {
                Some(p) => UserStore::by_id(conn, p.user_id)?,
                None => None,
            };
            let recipients = UserStore::with_push_tokens(conn)?;
            Ok((post, author, recipients))
        })? {
            (Some(post), Some(author), recipients) => (post, author, recipients),
            _ => return Ok(()),
        };

        if post.template_name != TEMPLATE_POST {
            return Ok(());
        }

        let recipients: Vec<User> =
            recipients.into_iter().filter(|u| u.id != author.id).collect();
        if recipients.is_empty() {
            tracing::info!(post_id, "No recipients for new-post notification");
            return Ok(());
        }

        let post_matrix = self.store.load(post_id).unwrap_or_else(|e| {
            tracing::warn!(post_id, error = %e, "Unreadable post embeddings, generic notifications only");
            None
        });

        let author_name = author.display_name().to_string();
        let mut sent = 0;
        for recipient in &recipients {
            let token = match &recipient.apns_token {
                Some(t) => t,
                None => continue,
            };

            let matched_query = post_matrix
                .as_ref()
                .and_then(|matrix| self.best_query_match(recipient.id, matrix));

            let result = match matched_query {
                Some(query_title) => self.sender.send(
                    token,
                    "New match",
                    &format!("'{}' matched a post from {}", query_title, author_name),
                ),
                None => self
                    .sender
                    .send(token, "New post", &format!("New post from {}", author_name)),
            };

            match result {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(user_id = recipient.id, error = %e, "Push delivery failed"),
            }
        }

        tracing::info!(post_id, sent, recipients = recipients.len(), "New-post notifications sent");
        Ok(())
    }

    pub fn notify_new_member(&self, user_id: i64) -> AppResult<()> {
        let (member, recipients) = match self.db.with(|conn| {
            let member = UserStore::by_id(conn, user_id)?;
            let recipients = UserStore::with_push_tokens(conn)?;
            Ok((member, recipients))
        })? {
            (Some(member), recipients) => (member, recipients),
            _ => return Ok(()),
        };

        let name = member.display_name().to_string();
        let mut sent = 0;
        for recipient in recipients.iter().filter(|u| u.id != user_id) {
            let token = match &recipient.apns_token {
                Some(t) => t,
                None => continue,
            };
            match self.sender.send(token, "New member", &format!("{} just joined", name)) {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(user_id = recipient.id, error = %e, "Push delivery failed"),
            }
        }

        tracing::info!(user_id, sent, "New-member notifications sent");
        Ok(())
    }

    /// The title of the recipient's best-matching query, if any clears
    /// the dense floor.
    fn best_query_match(
        &self,
        recipient_id: i64,
        post_matrix: &ndarray::Array2<f32>,
    ) -> Option<String> {
        let queries = self
            .db
            .with(|conn| PostStore::by_template(conn, TEMPLATE_QUERY))
            .unwrap_or_default();

        let mut best: Option<(f32, String)> = None;
        for query in queries.into_iter().filter(|q| q.user_id == recipient_id) {
            let query_matrix = match self.store.load(query.id) {
                Ok(Some(m)) => m,
                _ => continue,
            };
            let sims = embedding::similarity_matrix(&query_matrix, post_matrix);
            let max = embedding::max_scalar(&sims);
            if max >= PUSH_MATCH_THRESHOLD {
                match &best {
                    Some((current, _)) if *current >= max => {}
                    _ => best = Some((max, query.title.clone())),
                }
            }
        }
        best.map(|(_, title)| title)
    }
}
