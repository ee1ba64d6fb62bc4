//! Composition root. Everything the handlers touch hangs off one
//! `AppState` built at startup; there is no other shared mutable state
//! in the process besides the connection pool it owns.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::Config;
use crate::constants::{MATCH_QUEUE_CAPACITY, MATCH_QUEUE_WORKERS};
use crate::embedding::{build_encoder, EmbeddingStore};
use crate::judge::{AnthropicApi, ChatApi, LlmJudge};
use crate::matcher::{MatchQueue, Matcher};
use crate::notify::{DisabledPush, GatewayPush, Notifier, PushSender};
use crate::storage::Db;
use crate::{AppError, AppResult};

pub struct AppState {
    pub config: Config,
    pub db: Arc<Db>,
    pub embeddings: Arc<EmbeddingStore>,
    pub judge: Arc<LlmJudge>,
    pub matcher: Arc<Matcher>,
    pub queue: Arc<MatchQueue>,
    pub notifier: Arc<Notifier>,
    pub running: Arc<AtomicBool>,
}

pub type SharedState = Arc<AppState>;

/// Installed when no API key is configured; every call degrades to the
/// dense fallback through the usual judge-unavailable path.
struct NoKeyApi;

impl ChatApi for NoKeyApi {
    fn complete(&self, _model: &str, _prompt: &str, _max_tokens: u32) -> AppResult<String> {
        Err(AppError::JudgeUnavailable("ANTHROPIC_API_KEY not configured".into()))
    }
}

impl AppState {
    /// Build the process state: database (one retry), schema, encoder,
    /// judge, matcher, queue, notifier.
    pub fn build(config: Config) -> AppResult<SharedState> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.upload_dir)?;

        let db = match Db::open_and_migrate(&config.db_path, config.pool_size) {
            Ok(db) => db,
            Err(e) => {
                tracing::warn!(error = %e, "Database open failed, retrying once");
                std::thread::sleep(std::time::Duration::from_secs(1));
                Db::open_and_migrate(&config.db_path, config.pool_size)?
            }
        };
        let db = Arc::new(db);

        let encoder = build_encoder(config.embedding_mode, &config.model_dir())?;
        let embeddings = Arc::new(EmbeddingStore::new(&config.embeddings_dir(), encoder)?);

        let api: Arc<dyn ChatApi> = match &config.anthropic_api_key {
            Some(key) => Arc::new(AnthropicApi::new(key.clone())),
            None => {
                tracing::warn!("No ANTHROPIC_API_KEY; judge disabled, dense fallback only");
                Arc::new(NoKeyApi)
            }
        };
        let judge = Arc::new(LlmJudge::new(api, config.llm_model.clone(), db.clone()));

        let running = Arc::new(AtomicBool::new(true));
        let matcher = Arc::new(Matcher::new(
            db.clone(),
            embeddings.clone(),
            judge.clone(),
            running.clone(),
        ));
        let queue = Arc::new(MatchQueue::new(
            matcher.clone(),
            MATCH_QUEUE_WORKERS,
            MATCH_QUEUE_CAPACITY,
        ));

        let sender: Arc<dyn PushSender> = match &config.push_gateway_url {
            Some(url) => Arc::new(GatewayPush::new(url.clone(), config.push_gateway_token.clone())),
            None => {
                tracing::info!("No push gateway configured; notifications disabled");
                Arc::new(DisabledPush)
            }
        };
        let notifier = Arc::new(Notifier::new(db.clone(), embeddings.clone(), sender));

        Ok(Arc::new(AppState {
            config,
            db,
            embeddings,
            judge,
            matcher,
            queue,
            notifier,
            running,
        }))
    }

    /// Flip the running flag and drain the match queue.
    pub fn shutdown(&self) {
        self.running.store(false, std::sync::atomic::Ordering::Relaxed);
        self.queue.shutdown();
    }
}
