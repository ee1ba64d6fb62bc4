//! Per-post fragment embedding files.
//!
//! A post's fragments are `[title, summary]` followed by its body split
//! on the punctuation class `.,;:!?` with empty pieces dropped. The
//! encoded set is one `.npy` file per post id, a 2-D f32 array of shape
//! `(n_fragments, 768)`, replaced atomically (write-temp + rename) and
//! rebuildable from the posts table alone.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};

use crate::{AppError, AppResult};

use super::encoder::FragmentEncoder;

/// Split a post into the fragment sequence that gets embedded.
/// A pure function of the inputs; fragments are trimmed so the result
/// is stable under whitespace differences at fragment boundaries.
pub fn fragment_text(title: &str, summary: &str, body: &str) -> Vec<String> {
    let mut fragments = vec![title.trim().to_string(), summary.trim().to_string()];
    fragments.extend(
        body.split(['.', ',', ';', ':', '!', '?'])
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from),
    );
    fragments
}

pub struct EmbeddingStore {
    dir: PathBuf,
    encoder: Arc<dyn FragmentEncoder>,
}

impl EmbeddingStore {
    pub fn new(dir: &Path, encoder: Arc<dyn FragmentEncoder>) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf(), encoder })
    }

    pub fn path_for(&self, post_id: i64) -> PathBuf {
        self.dir.join(format!("post_{}.npy", post_id))
    }

    /// Encode and persist all fragments of a post. Returns the fragment
    /// count.
    pub fn put(&self, post_id: i64, title: &str, summary: &str, body: &str) -> AppResult<usize> {
        let fragments = fragment_text(title, summary, body);
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();

        let vectors = self.encoder.encode_batch(&refs)?;
        let dim = self.encoder.dim();
        let mut matrix = Array2::<f32>::zeros((vectors.len(), dim));
        for (i, v) in vectors.iter().enumerate() {
            if v.len() != dim {
                return Err(AppError::Embedding(format!(
                    "Encoder returned {} dims, expected {}",
                    v.len(),
                    dim
                )));
            }
            for (j, x) in v.iter().enumerate() {
                matrix[[i, j]] = *x;
            }
        }

        // Full-file replacement: write next to the target, then rename.
        let path = self.path_for(post_id);
        let tmp = self.dir.join(format!("post_{}.npy.tmp", post_id));
        write_npy(&tmp, &matrix)
            .map_err(|e| AppError::Embedding(format!("Write {} failed: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, &path)?;

        tracing::info!(post_id, fragments = fragments.len(), "Embeddings saved");
        Ok(fragments.len())
    }

    /// Load a post's fragment matrix, or None if absent.
    pub fn load(&self, post_id: i64) -> AppResult<Option<Array2<f32>>> {
        let path = self.path_for(post_id);
        if !path.exists() {
            return Ok(None);
        }
        let matrix: Array2<f32> = read_npy(&path)
            .map_err(|e| AppError::Embedding(format!("Read {} failed: {}", path.display(), e)))?;
        Ok(Some(matrix))
    }

    /// Idempotent delete.
    pub fn delete(&self, post_id: i64) -> AppResult<()> {
        let path = self.path_for(post_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(post_id, "Embeddings deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Post ids with an embedding file on disk, ascending.
    pub fn list_ids(&self) -> AppResult<Vec<i64>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_prefix("post_").and_then(|s| s.strip_suffix(".npy")) {
                if let Ok(id) = stem.parse::<i64>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn encoder(&self) -> &Arc<dyn FragmentEncoder> {
        &self.encoder
    }
}
