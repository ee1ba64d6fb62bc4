//! LLM judge: cached, batched relevance scoring over a chat-completion
//! API.
//!
//! Both call shapes share the same discipline: build a deterministic
//! prompt, look it up in the prompt cache, otherwise issue exactly one
//! temperature-0 request, extract the JSON array from the reply, cache
//! it. Every failure surfaces as `AppError::JudgeUnavailable`; the
//! matcher decides what to degrade to.

pub mod prompt;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{EVAL_MAX_TOKENS, LLM_TIMEOUT_SECS, RANK_MAX_TOKENS};
use crate::post::Post;
use crate::storage::prompt_cache::PromptCache;
use crate::storage::Db;
use crate::{AppError, AppResult};

pub use prompt::Candidate;

/// One blocking chat completion. Implementations must apply a timeout.
pub trait ChatApi: Send + Sync {
    fn complete(&self, model: &str, prompt: &str, max_tokens: u32) -> AppResult<String>;
}

/// Anthropic messages API over ureq.
pub struct AnthropicApi {
    api_key: String,
}

impl AnthropicApi {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

impl ChatApi for AnthropicApi {
    fn complete(&self, model: &str, prompt: &str, max_tokens: u32) -> AppResult<String> {
        let body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": 0.0,
            "messages": [{"role": "user", "content": prompt}]
        });

        let mut response = ureq::post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .config()
            .timeout_global(Some(Duration::from_secs(LLM_TIMEOUT_SECS)))
            .build()
            .send(serde_json::to_vec(&body)?.as_slice())
            .map_err(|e| AppError::JudgeUnavailable(format!("API call failed: {}", e)))?;

        let parsed: serde_json::Value = response
            .body_mut()
            .read_json()
            .map_err(|e| AppError::JudgeUnavailable(format!("Bad API response: {}", e)))?;

        parsed["content"][0]["text"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| AppError::JudgeUnavailable("Response carried no text content".into()))
    }
}

/// Pull the first JSON array out of a model reply, tolerating
/// triple-backtick fences and prose framing. Anything that does not
/// contain a bracket-balanced array is a judge failure, never a silent
/// mis-score.
pub fn extract_json_array(raw: &str) -> AppResult<String> {
    let text = raw.trim();

    let inner = if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        match rest.find("```") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else {
        text
    };

    let array_start = inner
        .find('[')
        .ok_or_else(|| AppError::JudgeUnavailable("No JSON array in reply".into()))?;

    let mut depth = 0usize;
    for (i, c) in inner[array_start..].char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(inner[array_start..array_start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    Err(AppError::JudgeUnavailable("Unterminated JSON array in reply".into()))
}

#[derive(Debug, Deserialize)]
struct RankItem {
    id: i64,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct EvalItem {
    query_id: i64,
    score: f64,
}

/// A judged `(id, score)` pair on the 0-100 scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub id: i64,
    pub score: f64,
}

pub struct LlmJudge {
    api: Arc<dyn ChatApi>,
    model: String,
    db: Arc<Db>,
}

impl LlmJudge {
    pub fn new(api: Arc<dyn ChatApi>, model: String, db: Arc<Db>) -> Self {
        Self { api, model, db }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Rank candidates against one query. Verdict ids are post ids.
    pub fn rank(&self, query: &Post, candidates: &[Candidate]) -> AppResult<Vec<Verdict>> {
        let prompt = prompt::build_rank_prompt(query, candidates);
        let results = self.complete_cached(&prompt, RANK_MAX_TOKENS)?;
        let items: Vec<RankItem> = serde_json::from_value(results)
            .map_err(|e| AppError::JudgeUnavailable(format!("Malformed rank reply: {}", e)))?;
        Ok(items
            .into_iter()
            .map(|item| Verdict { id: item.id, score: item.score.clamp(0.0, 100.0) })
            .collect())
    }

    /// Evaluate one post against a batch of queries. Verdict ids are
    /// query ids. Callers keep batches at or under 20.
    pub fn evaluate(&self, queries: &[Post], post: &Post) -> AppResult<Vec<Verdict>> {
        let prompt = prompt::build_evaluate_prompt(queries, post);
        let results = self.complete_cached(&prompt, EVAL_MAX_TOKENS)?;
        let items: Vec<EvalItem> = serde_json::from_value(results)
            .map_err(|e| AppError::JudgeUnavailable(format!("Malformed evaluate reply: {}", e)))?;
        Ok(items
            .into_iter()
            .map(|item| Verdict { id: item.query_id, score: item.score.clamp(0.0, 100.0) })
            .collect())
    }

    /// Cache lookup, then at most one network call. The connection is
    /// held only around the cache operations, never across the call.
    fn complete_cached(&self, prompt: &str, max_tokens: u32) -> AppResult<serde_json::Value> {
        let cached = self.db.with(|conn| PromptCache::get(conn, prompt, &self.model))?;
        if let Some(results) = cached {
            return Ok(results);
        }

        let raw = self.api.complete(&self.model, prompt, max_tokens)?;
        let json_text = extract_json_array(&raw)?;
        let results: serde_json::Value = serde_json::from_str(&json_text)
            .map_err(|e| AppError::JudgeUnavailable(format!("Reply is not valid JSON: {}", e)))?;

        if !results.is_array() {
            return Err(AppError::JudgeUnavailable("Reply is not a JSON array".into()));
        }

        self.db.with(|conn| PromptCache::store(conn, prompt, &self.model, &results))?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::{PostParent, TEMPLATE_QUERY};
    use crate::test_helpers::{test_db, ScriptedApi};

    fn post(id: i64, title: &str) -> Post {
        Post {
            id,
            user_id: 1,
            parent: PostParent::Root,
            title: title.into(),
            summary: "s".into(),
            body: "b".into(),
            template_name: TEMPLATE_QUERY.into(),
            timezone: "UTC".into(),
            location_tag: None,
            ai_generated: false,
            image_url: None,
            clip_offset_x: None,
            clip_offset_y: None,
            rev: 0,
            has_new_matches: false,
            last_match_added_at: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn candidate(id: i64) -> Candidate {
        Candidate { id, title: "t".into(), summary: "s".into(), body: "b".into(), dense: 0.5 }
    }

    #[test]
    fn test_extract_plain_array() {
        assert_eq!(extract_json_array("[1, 2, 3]").unwrap(), "[1, 2, 3]");
    }

    #[test]
    fn test_extract_from_json_fence() {
        let raw = "Here you go:\n```json\n[{\"id\": 1, \"score\": 70}]\n```\nDone.";
        assert_eq!(extract_json_array(raw).unwrap(), "[{\"id\": 1, \"score\": 70}]");
    }

    #[test]
    fn test_extract_from_bare_fence() {
        let raw = "```\n[1]\n```";
        assert_eq!(extract_json_array(raw).unwrap(), "[1]");
    }

    #[test]
    fn test_extract_from_prose() {
        let raw = "The scores are [ [1,2], [3,4] ] as requested.";
        assert_eq!(extract_json_array(raw).unwrap(), "[ [1,2], [3,4] ]");
    }

    #[test]
    fn test_extract_rejects_no_array() {
        assert!(matches!(
            extract_json_array("no json here"),
            Err(AppError::JudgeUnavailable(_))
        ));
        assert!(matches!(
            extract_json_array("open [1, 2"),
            Err(AppError::JudgeUnavailable(_))
        ));
    }

    #[test]
    fn test_rank_parses_and_clamps() {
        let db = test_db();
        let api = Arc::new(ScriptedApi::replying(vec![Ok(
            "[{\"id\": 2, \"score\": 70}, {\"id\": 3, \"score\": 150}]".into(),
        )]));
        let judge = LlmJudge::new(api.clone(), "test-model".into(), db);

        let verdicts = judge.rank(&post(1, "q"), &[candidate(2), candidate(3)]).unwrap();
        assert_eq!(verdicts[0], Verdict { id: 2, score: 70.0 });
        assert_eq!(verdicts[1], Verdict { id: 3, score: 100.0 });
    }

    #[test]
    fn test_cache_hit_skips_network() {
        let db = test_db();
        let api = Arc::new(ScriptedApi::replying(vec![Ok("[{\"id\": 2, \"score\": 61}]".into())]));
        let judge = LlmJudge::new(api.clone(), "test-model".into(), db);

        let query = post(1, "q");
        let first = judge.rank(&query, &[candidate(2)]).unwrap();
        let second = judge.rank(&query, &[candidate(2)]).unwrap();
        assert_eq!(first, second);
        assert_eq!(api.calls(), 1);
    }

    #[test]
    fn test_api_failure_is_judge_unavailable() {
        let db = test_db();
        let api = Arc::new(ScriptedApi::replying(vec![Err(AppError::JudgeUnavailable(
            "down".into(),
        ))]));
        let judge = LlmJudge::new(api, "test-model".into(), db);

        let result = judge.rank(&post(1, "q"), &[candidate(2)]);
        assert!(matches!(result, Err(AppError::JudgeUnavailable(_))));
    }

    #[test]
    fn test_garbage_reply_is_judge_unavailable_and_not_cached() {
        let db = test_db();
        let api = Arc::new(ScriptedApi::replying(vec![
            Ok("I cannot answer that.".into()),
            Ok("[{\"id\": 2, \"score\": 55}]".into()),
        ]));
        let judge = LlmJudge::new(api.clone(), "test-model".into(), db);

        let query = post(1, "q");
        assert!(judge.rank(&query, &[candidate(2)]).is_err());
        // Second attempt hits the API again (failure was not cached).
        let verdicts = judge.rank(&query, &[candidate(2)]).unwrap();
        assert_eq!(verdicts[0].score, 55.0);
        assert_eq!(api.calls(), 2);
    }

    #[test]
    fn test_evaluate_parses_query_ids() {
        let db = test_db();
        let api = Arc::new(ScriptedApi::replying(vec![Ok(
            "[{\"query_id\": 5, \"score\": 65}, {\"query_id\": 6, \"score\": 5}]".into(),
        )]));
        let judge = LlmJudge::new(api, "test-model".into(), db);

        let verdicts = judge.evaluate(&[post(5, "q5"), post(6, "q6")], &post(9, "p")).unwrap();
        assert_eq!(verdicts[0], Verdict { id: 5, score: 65.0 });
        assert_eq!(verdicts[1], Verdict { id: 6, score: 5.0 });
    }
}
