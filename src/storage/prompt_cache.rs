//! Prompt/result cache for the LLM judge.
//!
//! Keyed by SHA-256 over the exact prompt bytes plus the model name.
//! Insert-if-absent; rows are never updated.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::{AppError, AppResult};

pub struct PromptCache;

pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl PromptCache {
    pub fn get(
        conn: &Connection,
        prompt: &str,
        model_name: &str,
    ) -> AppResult<Option<serde_json::Value>> {
        let hash = prompt_hash(prompt);
        let stored: Option<String> = conn
            .query_row(
                "SELECT llm_results FROM search_cache
                 WHERE prompt_hash = ?1 AND model_name = ?2",
                params![hash, model_name],
                |r| r.get(0),
            )
            .optional()?;

        match stored {
            Some(json) => {
                let value = serde_json::from_str(&json)
                    .map_err(|e| AppError::Storage(format!("Corrupt cache row {}: {}", &hash[..8], e)))?;
                tracing::debug!(hash = %&hash[..8], "Prompt cache hit");
                Ok(Some(value))
            }
            None => {
                tracing::debug!(hash = %&hash[..8], "Prompt cache miss");
                Ok(None)
            }
        }
    }

    pub fn store(
        conn: &Connection,
        prompt: &str,
        model_name: &str,
        results: &serde_json::Value,
    ) -> AppResult<()> {
        let hash = prompt_hash(prompt);
        conn.execute(
            "INSERT OR IGNORE INTO search_cache (prompt_hash, model_name, llm_results, created_at)
             VALUES (?1, ?2, ?3, datetime('now'))",
            params![hash, model_name, serde_json::to_string(results)?],
        )?;
        Ok(())
    }
}
