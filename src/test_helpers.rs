//! Shared test utilities — a wired-up environment with stub encoder,
//! scripted judge and recording push sender. `#[cfg(test)]` only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use crate::config::{Config, EmbeddingMode};
use crate::constants::EMBED_DIM;
use crate::embedding::{EmbeddingStore, FragmentEncoder, HashEncoder};
use crate::http::{AppState, SharedState};
use crate::judge::{ChatApi, LlmJudge};
use crate::matcher::{MatchQueue, Matcher};
use crate::notify::{Notifier, PushSender};
use crate::post::{NewPost, PostParent, TEMPLATE_POST, TEMPLATE_QUERY};
use crate::storage::match_cache::{CachedMatch, MatchCache};
use crate::storage::posts::PostStore;
use crate::storage::users::{NewUser, UserStore};
use crate::storage::Db;
use crate::{AppError, AppResult};

/// A migrated database on disk, kept for the process lifetime.
pub fn test_db() -> Arc<Db> {
    let dir = TempDir::new().unwrap();
    let db = Db::open_and_migrate(&dir.path().join("test.db"), 2).unwrap();
    // Tests may outlive this frame's guards; keep the files around.
    std::mem::forget(dir);
    Arc::new(db)
}

// ── Stub encoder ──

/// Hash encoder with per-text vector overrides for similarity-pinned
/// tests.
pub struct StubEncoder {
    fixed: Mutex<HashMap<String, Vec<f32>>>,
    fallback: HashEncoder,
}

impl StubEncoder {
    pub fn new() -> Self {
        Self { fixed: Mutex::new(HashMap::new()), fallback: HashEncoder }
    }

    pub fn pin(&self, text: &str, vector: Vec<f32>) {
        assert_eq!(vector.len(), EMBED_DIM);
        self.fixed.lock().unwrap().insert(text.to_string(), vector);
    }
}

impl FragmentEncoder for StubEncoder {
    fn encode_batch(&self, texts: &[&str]) -> AppResult<Vec<Vec<f32>>> {
        let fixed = self.fixed.lock().unwrap();
        texts
            .iter()
            .map(|&t| match fixed.get(t) {
                Some(v) => Ok(v.clone()),
                None => Ok(self.fallback.encode_batch(&[t])?.remove(0)),
            })
            .collect()
    }
}

// ── Scripted judge transport ──

/// Replays queued replies; an exhausted script reports the judge
/// unavailable.
pub struct ScriptedApi {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self { replies: Mutex::new(VecDeque::new()), calls: AtomicUsize::new(0) }
    }

    pub fn replying(replies: Vec<AppResult<String>>) -> Self {
        let api = Self::new();
        {
            let mut queue = api.replies.lock().unwrap();
            for reply in replies {
                queue.push_back(reply.map_err(|e| e.to_string()));
            }
        }
        api
    }

    pub fn push_reply(&self, reply: String) {
        self.replies.lock().unwrap().push_back(Ok(reply));
    }

    pub fn push_error(&self) {
        self.replies.lock().unwrap().push_back(Err("scripted outage".into()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ChatApi for ScriptedApi {
    fn complete(&self, _model: &str, _prompt: &str, _max_tokens: u32) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(AppError::JudgeUnavailable(message)),
            None => Err(AppError::JudgeUnavailable("no scripted reply".into())),
        }
    }
}

// ── Recording push sender ──

pub struct RecordingPush {
    sends: Mutex<Vec<(String, String, String)>>,
    failing_tokens: Mutex<HashSet<String>>,
}

impl RecordingPush {
    pub fn new() -> Self {
        Self { sends: Mutex::new(Vec::new()), failing_tokens: Mutex::new(HashSet::new()) }
    }
}

impl PushSender for RecordingPush {
    fn send(&self, device_token: &str, title: &str, body: &str) -> AppResult<()> {
        if self.failing_tokens.lock().unwrap().contains(device_token) {
            return Err(AppError::Push("scripted delivery failure".into()));
        }
        self.sends.lock().unwrap().push((
            device_token.to_string(),
            title.to_string(),
            body.to_string(),
        ));
        Ok(())
    }
}

// ── Wired environment ──

pub struct TestEnv {
    pub state: SharedState,
    pub db: Arc<Db>,
    pub store: Arc<EmbeddingStore>,
    pub matcher: Arc<Matcher>,
    pub notifier: Arc<Notifier>,
    pub encoder: Arc<StubEncoder>,
    pub api: Arc<ScriptedApi>,
    pub push: Arc<RecordingPush>,
    pub author_id: i64,
    _tmp: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        let config = Config {
            bind_addr: "127.0.0.1:0".into(),
            db_path: data_dir.join("lantern.db"),
            upload_dir: data_dir.join("uploads"),
            data_dir,
            pool_size: 2,
            embedding_mode: EmbeddingMode::HashOnly,
            anthropic_api_key: None,
            llm_model: "test-model".into(),
            push_gateway_url: None,
            push_gateway_token: None,
        };

        let db = Arc::new(Db::open_and_migrate(&config.db_path, config.pool_size).unwrap());
        let encoder = Arc::new(StubEncoder::new());
        let encoder_dyn: Arc<dyn FragmentEncoder> = encoder.clone();
        let store = Arc::new(EmbeddingStore::new(&config.embeddings_dir(), encoder_dyn).unwrap());

        let api = Arc::new(ScriptedApi::new());
        let api_dyn: Arc<dyn ChatApi> = api.clone();
        let judge = Arc::new(LlmJudge::new(api_dyn, config.llm_model.clone(), db.clone()));

        let running = Arc::new(AtomicBool::new(true));
        let matcher =
            Arc::new(Matcher::new(db.clone(), store.clone(), judge.clone(), running.clone()));
        let queue = Arc::new(MatchQueue::new(matcher.clone(), 1, 32));

        let push = Arc::new(RecordingPush::new());
        let push_dyn: Arc<dyn PushSender> = push.clone();
        let notifier = Arc::new(Notifier::new(db.clone(), store.clone(), push_dyn));

        let author_id =
            db.with(|conn| UserStore::insert(conn, &NewUser::for_email("author@example.com"))).unwrap();

        let state = Arc::new(AppState {
            config,
            db: db.clone(),
            embeddings: store.clone(),
            judge,
            matcher: matcher.clone(),
            queue,
            notifier: notifier.clone(),
            running,
        });

        Self { state, db, store, matcher, notifier, encoder, api, push, author_id, _tmp: tmp }
    }

    // ── Seeding ──

    pub fn seed_user(&self, email: &str, push_token: Option<&str>) -> i64 {
        self.db
            .with(|conn| {
                let id = UserStore::insert(conn, &NewUser::for_email(email))?;
                if let Some(token) = push_token {
                    UserStore::set_apns_token(conn, id, token)?;
                }
                Ok(id)
            })
            .unwrap()
    }

    pub fn set_push_token(&self, user_id: i64, token: &str) {
        self.db.with(|conn| UserStore::set_apns_token(conn, user_id, token).map(|_| ())).unwrap();
    }

    fn seed(&self, user_id: i64, title: &str, summary: &str, body: &str, template: &str) -> i64 {
        let id = self
            .db
            .with(|conn| {
                PostStore::insert(
                    conn,
                    &NewPost {
                        user_id,
                        parent: PostParent::Root,
                        title: title.into(),
                        summary: summary.into(),
                        body: body.into(),
                        template_name: template.into(),
                        timezone: "UTC".into(),
                        location_tag: None,
                        ai_generated: false,
                        image_url: None,
                    },
                )
            })
            .unwrap();
        self.store.put(id, title, summary, body).unwrap();
        id
    }

    pub fn seed_post(&self, title: &str, summary: &str, body: &str) -> i64 {
        self.seed(self.author_id, title, summary, body, TEMPLATE_POST)
    }

    pub fn seed_query(&self, title: &str, summary: &str, body: &str) -> i64 {
        self.seed(self.author_id, title, summary, body, TEMPLATE_QUERY)
    }

    pub fn seed_post_with_vector(&self, title: &str, vector: &[f32]) -> i64 {
        self.encoder.pin(title, vector.to_vec());
        self.seed(self.author_id, title, "", "", TEMPLATE_POST)
    }

    pub fn seed_query_with_vector(&self, title: &str, vector: &[f32]) -> i64 {
        self.encoder.pin(title, vector.to_vec());
        self.seed(self.author_id, title, "", "", TEMPLATE_QUERY)
    }

    pub fn seed_query_for_user_with_vector(&self, user_id: i64, title: &str, vector: &[f32]) -> i64 {
        self.encoder.pin(title, vector.to_vec());
        self.seed(user_id, title, "", "", TEMPLATE_QUERY)
    }

    /// Content edit the way the update path does it: new text, bumped
    /// revision, regenerated embeddings.
    pub fn update_post(&self, post_id: i64, title: &str, summary: &str, body: &str) {
        self.db
            .with(|conn| {
                PostStore::update_content(conn, post_id, title, summary, body, None, None, None)
                    .map(|_| ())
            })
            .unwrap();
        self.store.put(post_id, title, summary, body).unwrap();
    }

    // ── Inspection ──

    pub fn cached_results(&self, query_id: i64) -> Vec<CachedMatch> {
        self.db.with(|conn| MatchCache::results_for(conn, query_id)).unwrap()
    }

    pub fn last_match_added(&self, query_id: i64) -> Option<DateTime<Utc>> {
        self.db
            .with(|conn| PostStore::get(conn, query_id))
            .unwrap()
            .and_then(|p| p.last_match_added_at)
    }

    pub fn judge_calls(&self) -> usize {
        self.api.calls()
    }

    pub fn push_judge_reply(&self, reply: String) {
        self.api.push_reply(reply);
    }

    pub fn push_judge_error(&self) {
        self.api.push_error();
    }

    pub fn pushes(&self) -> Vec<(String, String, String)> {
        self.push.sends.lock().unwrap().clone()
    }

    pub fn fail_pushes_to(&self, token: &str) {
        self.push.failing_tokens.lock().unwrap().insert(token.to_string());
    }

    // ── Pinned vectors ──

    /// The reference direction used by similarity-pinned tests.
    pub fn base_vector(&self) -> Vec<f32> {
        let mut v = vec![0.0; EMBED_DIM];
        v[0] = 1.0;
        v
    }

    /// A unit vector whose cosine similarity against [`base_vector`] is
    /// exactly `target`.
    pub fn vector_pair(&self, target: f32) -> Vec<f32> {
        let mut v = vec![0.0; EMBED_DIM];
        v[0] = target;
        v[1] = (1.0 - target * target).sqrt();
        v
    }
}
