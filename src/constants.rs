//! Engine-wide tunables.

/// Embedding dimension (all-mpnet-base-v2 native dim).
pub const EMBED_DIM: usize = 768;

/// Max token length for encoder input per fragment.
pub const MAX_TOKENS: usize = 384;

/// Minimum relevance score (0-100 scale) stored in the match cache.
pub const MATCH_THRESHOLD: f64 = 40.0;

/// Dense-similarity floor used when the judge is unavailable.
pub const DENSE_FALLBACK_THRESHOLD: f32 = 0.4;

/// Candidates hydrated for LLM ranking.
pub const CANDIDATE_LIMIT: usize = 20;

/// Queries evaluated per judge batch.
pub const EVAL_BATCH_SIZE: usize = 20;

/// Dense-similarity floor for "matched your query" push notifications.
pub const PUSH_MATCH_THRESHOLD: f32 = 0.3;

/// SQLite busy timeout.
pub const SQLITE_BUSY_TIMEOUT_MS: u32 = 5_000;

/// Seconds a caller waits for a pooled connection before giving up.
pub const POOL_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Connection pool bounds.
pub const POOL_MIN_CONNECTIONS: usize = 1;
pub const POOL_MAX_CONNECTIONS: usize = 10;

/// Timeout for one chat-completion call.
pub const LLM_TIMEOUT_SECS: u64 = 30;

/// Timeout for one push delivery.
pub const PUSH_TIMEOUT_SECS: u64 = 5;

/// Max output tokens for the two judge call shapes.
pub const RANK_MAX_TOKENS: u32 = 2_000;
pub const EVAL_MAX_TOKENS: u32 = 1_000;

/// Match queue sizing.
pub const MATCH_QUEUE_CAPACITY: usize = 256;
pub const MATCH_QUEUE_WORKERS: usize = 2;

/// Default judge model.
pub const DEFAULT_LLM_MODEL: &str = "claude-3-5-haiku-20241022";

/// Marker file written on intentional shutdown.
pub const SHUTDOWN_MARKER: &str = "shutdown.intentional";
