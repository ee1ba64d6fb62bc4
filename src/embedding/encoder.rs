//! Fragment encoders.
//!
//! The real encoder is all-mpnet-base-v2 under ONNX Runtime: mean
//! pooling over the attention mask, L2-normalised 768-dim output. The
//! hashed term-frequency encoder is the deterministic offline fallback
//! behind the same trait; tests use it exclusively.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};

use crate::config::EmbeddingMode;
use crate::constants::{EMBED_DIM, MAX_TOKENS};
use crate::{AppError, AppResult};

/// Encodes text fragments into fixed-dimension unit vectors.
pub trait FragmentEncoder: Send + Sync {
    fn encode_batch(&self, texts: &[&str]) -> AppResult<Vec<Vec<f32>>>;

    fn dim(&self) -> usize {
        EMBED_DIM
    }
}

/// Pick the encoder for the configured mode.
///
/// ONNX initialisation is wrapped in `catch_unwind` because `ort` with
/// `load-dynamic` panics when `libonnxruntime.so` is missing instead of
/// returning Err.
pub fn build_encoder(mode: EmbeddingMode, model_dir: &Path) -> AppResult<Arc<dyn FragmentEncoder>> {
    match mode {
        EmbeddingMode::HashOnly => {
            tracing::info!("Using hashed term-frequency encoder");
            Ok(Arc::new(HashEncoder))
        }
        EmbeddingMode::Disabled => Ok(Arc::new(DisabledEncoder)),
        EmbeddingMode::OnnxOnly => {
            let encoder = try_onnx(model_dir)
                .map_err(|e| AppError::Embedding(format!("ONNX encoder required: {}", e)))?;
            Ok(Arc::new(encoder))
        }
        EmbeddingMode::OnnxWithFallback => match try_onnx(model_dir) {
            Ok(encoder) => {
                tracing::info!("ONNX encoder loaded (all-mpnet-base-v2)");
                Ok(Arc::new(encoder))
            }
            Err(e) => {
                tracing::warn!(error = %e, "ONNX unavailable, using hashed encoder");
                Ok(Arc::new(HashEncoder))
            }
        },
    }
}

fn try_onnx(model_dir: &Path) -> Result<OnnxEncoder, String> {
    let dir = model_dir.to_path_buf();
    match std::panic::catch_unwind(move || OnnxEncoder::load(&dir)) {
        Ok(result) => result,
        Err(_) => Err("ONNX init panicked (likely missing libonnxruntime.so)".into()),
    }
}

// ── ONNX ──

pub struct OnnxEncoder {
    session: Mutex<ort::session::Session>,
    tokenizer: tokenizers::Tokenizer,
}

impl OnnxEncoder {
    pub fn load(model_dir: &PathBuf) -> Result<Self, String> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(format!("model.onnx not found at {}", model_path.display()));
        }
        if !tokenizer_path.exists() {
            return Err(format!("tokenizer.json not found at {}", tokenizer_path.display()));
        }

        let session = ort::session::Session::builder()
            .map_err(|e| format!("ONNX session builder: {}", e))?
            .with_intra_threads(1)
            .map_err(|e| format!("ONNX set threads: {}", e))?
            .commit_from_file(&model_path)
            .map_err(|e| format!("ONNX load model: {}", e))?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| format!("Tokenizer load: {}", e))?;

        Ok(Self { session: Mutex::new(session), tokenizer })
    }

    fn encode_one(&self, text: &str) -> Result<Vec<f32>, String> {
        use ort::value::Tensor;

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| format!("Tokenize failed: {}", e))?;

        let mut input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        let mut attention_mask: Vec<i64> =
            encoding.get_attention_mask().iter().map(|&m| m as i64).collect();
        let mut token_type_ids: Vec<i64> =
            encoding.get_type_ids().iter().map(|&t| t as i64).collect();

        if input_ids.len() > MAX_TOKENS {
            input_ids.truncate(MAX_TOKENS);
            attention_mask.truncate(MAX_TOKENS);
            token_type_ids.truncate(MAX_TOKENS);
        }

        let seq_len = input_ids.len();

        let input_ids_tensor = Tensor::from_array(([1, seq_len], input_ids))
            .map_err(|e| format!("input_ids tensor: {}", e))?;
        let attention_mask_tensor = Tensor::from_array(([1, seq_len], attention_mask.clone()))
            .map_err(|e| format!("attention_mask tensor: {}", e))?;
        let token_type_ids_tensor = Tensor::from_array(([1, seq_len], token_type_ids))
            .map_err(|e| format!("token_type_ids tensor: {}", e))?;

        let mut session = self.session.lock().map_err(|e| format!("Mutex poisoned: {}", e))?;
        let outputs = session
            .run(ort::inputs! {
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_ids_tensor,
            })
            .map_err(|e| format!("ONNX run: {}", e))?;

        let (shape, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("Extract tensor: {}", e))?;

        // Output is [1, seq_len, dim]; mean-pool under the mask.
        let dim2 = if shape.len() >= 3 { shape[2] as usize } else { EMBED_DIM };

        let mut pooled = vec![0.0f32; EMBED_DIM];
        let mut mask_sum = 0.0f32;

        for t in 0..seq_len {
            let mask_val = attention_mask[t] as f32;
            if mask_val > 0.0 {
                let offset = t * dim2;
                for d in 0..EMBED_DIM.min(dim2) {
                    pooled[d] += raw_data[offset + d] * mask_val;
                }
                mask_sum += mask_val;
            }
        }

        if mask_sum > 0.0 {
            for v in pooled.iter_mut() {
                *v /= mask_sum;
            }
        }

        l2_normalize(&mut pooled);
        Ok(pooled)
    }
}

impl FragmentEncoder for OnnxEncoder {
    fn encode_batch(&self, texts: &[&str]) -> AppResult<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|t| self.encode_one(t).map_err(AppError::Embedding))
            .collect()
    }
}

// ── Hashed term-frequency fallback ──

/// Deterministic 768-dim encoder: MD5-hashed unigrams and bigrams,
/// L2-normalised. Offline and dependency-free at runtime.
pub struct HashEncoder;

impl HashEncoder {
    fn encode_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; EMBED_DIM];

        let lower = text.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();

        if words.is_empty() {
            return vector;
        }

        for word in &words {
            let w = word.trim_matches(|c: char| !c.is_alphanumeric());
            if w.len() < 2 {
                continue;
            }
            hash_term_into(&mut vector, w, 1.0);
        }

        for pair in words.windows(2) {
            let bigram = format!(
                "{}_{}",
                pair[0].trim_matches(|c: char| !c.is_alphanumeric()),
                pair[1].trim_matches(|c: char| !c.is_alphanumeric())
            );
            hash_term_into(&mut vector, &bigram, 0.7);
        }

        l2_normalize(&mut vector);
        vector
    }
}

impl FragmentEncoder for HashEncoder {
    fn encode_batch(&self, texts: &[&str]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.encode_one(t)).collect())
    }
}

/// Used when embeddings are configured off. Posts are still stored; the
/// matcher skips them.
struct DisabledEncoder;

impl FragmentEncoder for DisabledEncoder {
    fn encode_batch(&self, _texts: &[&str]) -> AppResult<Vec<Vec<f32>>> {
        Err(AppError::Embedding("embeddings disabled".into()))
    }
}

fn hash_term_into(vector: &mut [f32], term: &str, weight: f32) {
    let mut hasher = Md5::new();
    hasher.update(term.as_bytes());
    let hash = hasher.finalize();

    let idx = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]) as usize % vector.len();
    let sign = if hash[4] & 1 == 0 { 1.0f32 } else { -1.0f32 };
    vector[idx] += sign * weight;

    let idx2 = u32::from_le_bytes([hash[5], hash[6], hash[7], hash[8]]) as usize % vector.len();
    let sign2 = if hash[9] & 1 == 0 { 1.0f32 } else { -1.0f32 };
    vector[idx2] += sign2 * weight * 0.5;
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
