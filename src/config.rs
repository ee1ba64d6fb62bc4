//! Runtime configuration, read once at startup.
//!
//! `.env` (via dotenvy) is the only supported source for secrets; every
//! value can also come from the process environment directly. The parsed
//! `Config` is owned by the composition root and injected from there —
//! no package-level mutable state.

use std::path::PathBuf;

use crate::constants::{DEFAULT_LLM_MODEL, POOL_MAX_CONNECTIONS, POOL_MIN_CONNECTIONS};

/// How fragment embeddings are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingMode {
    /// ONNX Runtime (best). If unavailable at startup, fall back to the
    /// hashed term-frequency encoder.
    #[default]
    OnnxWithFallback,
    /// ONNX only. Startup fails if the model cannot be loaded.
    OnnxOnly,
    /// Hashed term-frequency encoder only (offline, deterministic).
    HashOnly,
    /// No embeddings. Matching degrades to nothing; posts are still stored.
    Disabled,
}

fn parse_embedding_mode(s: &str) -> EmbeddingMode {
    match s.to_lowercase().as_str() {
        "onnx" => EmbeddingMode::OnnxOnly,
        "hash" => EmbeddingMode::HashOnly,
        "disabled" => EmbeddingMode::Disabled,
        _ => EmbeddingMode::OnnxWithFallback,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
    pub pool_size: usize,
    pub embedding_mode: EmbeddingMode,
    pub anthropic_api_key: Option<String>,
    pub llm_model: String,
    pub push_gateway_url: Option<String>,
    pub push_gateway_token: Option<String>,
}

impl Config {
    /// Load `.env` if present, then read the environment.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let data_dir = PathBuf::from(env_or("LANTERN_DATA_DIR", "data"));
        let db_path = std::env::var("LANTERN_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("lantern.db"));
        let upload_dir = std::env::var("LANTERN_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("uploads"));

        let pool_size = std::env::var("LANTERN_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(4)
            .clamp(POOL_MIN_CONNECTIONS, POOL_MAX_CONNECTIONS);

        Self {
            bind_addr: env_or("LANTERN_BIND_ADDR", "0.0.0.0:8080"),
            data_dir,
            db_path,
            upload_dir,
            pool_size,
            embedding_mode: parse_embedding_mode(&env_or("LANTERN_EMBEDDING_MODE", "")),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok().filter(|s| !s.is_empty()),
            llm_model: env_or("LANTERN_LLM_MODEL", DEFAULT_LLM_MODEL),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL").ok().filter(|s| !s.is_empty()),
            push_gateway_token: std::env::var("PUSH_GATEWAY_TOKEN").ok().filter(|s| !s.is_empty()),
        }
    }

    /// Directory holding the per-post `.npy` fragment files.
    pub fn embeddings_dir(&self) -> PathBuf {
        self.data_dir.join("embeddings")
    }

    /// Directory holding the ONNX model and tokenizer.
    pub fn model_dir(&self) -> PathBuf {
        self.data_dir.join("models").join("all-mpnet-base-v2")
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}
