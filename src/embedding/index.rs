//! In-memory vector index over the embedding store.
//!
//! A snapshot is assembled on demand per matcher invocation: the
//! row-concatenation of every fragment file on disk plus a parallel
//! `(post_id, fragment_index)` map. Snapshots are immutable values;
//! there is no background refresh.

use ndarray::{Array2, Axis};
use rayon::prelude::*;

use crate::AppResult;

use super::store::EmbeddingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub post_id: i64,
    pub fragment_index: usize,
}

pub struct IndexSnapshot {
    pub matrix: Array2<f32>,
    pub entries: Vec<IndexEntry>,
}

impl IndexSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Assemble a snapshot from every fragment file currently on disk.
pub fn snapshot(store: &EmbeddingStore) -> AppResult<IndexSnapshot> {
    let ids = store.list_ids()?;

    let loaded: Vec<(i64, Array2<f32>)> = ids
        .par_iter()
        .filter_map(|&id| match store.load(id) {
            Ok(Some(matrix)) => Some((id, matrix)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(post_id = id, error = %e, "Skipping unreadable embedding file");
                None
            }
        })
        .collect();

    let total_rows: usize = loaded.iter().map(|(_, m)| m.shape()[0]).sum();
    let dim = loaded.first().map(|(_, m)| m.shape()[1]).unwrap_or(0);

    let mut matrix = Array2::<f32>::zeros((total_rows, dim));
    let mut entries = Vec::with_capacity(total_rows);
    let mut row = 0;
    for (post_id, post_matrix) in &loaded {
        for (fragment_index, fragment) in post_matrix.axis_iter(Axis(0)).enumerate() {
            matrix.row_mut(row).assign(&fragment);
            entries.push(IndexEntry { post_id: *post_id, fragment_index });
            row += 1;
        }
    }

    Ok(IndexSnapshot { matrix, entries })
}

/// Dense cosine-similarity matrix: `M[i, j]` is the similarity between
/// row i of `a` and row j of `b`. Rows are L2-normalised once, then the
/// result is a single inner product.
pub fn similarity_matrix(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
    let a_norm = l2_normalize_rows(a);
    let b_norm = l2_normalize_rows(b);
    a_norm.dot(&b_norm.t())
}

fn l2_normalize_rows(m: &Array2<f32>) -> Array2<f32> {
    let mut out = m.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|x| x / norm);
        }
    }
    out
}

/// MAX-per-post aggregation over a `(query_fragments, index_fragments)`
/// similarity matrix, skipping `skip_post`. Returns `(post_id, max)`
/// pairs sorted by similarity descending.
pub fn max_per_post(
    similarities: &Array2<f32>,
    entries: &[IndexEntry],
    skip_post: i64,
) -> Vec<(i64, f32)> {
    let mut best: std::collections::HashMap<i64, f32> = std::collections::HashMap::new();

    for (j, entry) in entries.iter().enumerate() {
        if entry.post_id == skip_post {
            continue;
        }
        let column_max = similarities
            .column(j)
            .iter()
            .cloned()
            .fold(f32::NEG_INFINITY, f32::max);
        best.entry(entry.post_id)
            .and_modify(|m| *m = m.max(column_max))
            .or_insert(column_max);
    }

    let mut ranked: Vec<(i64, f32)> = best.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    ranked
}

/// MAX over the whole matrix (post-vs-one-query shape).
pub fn max_scalar(similarities: &Array2<f32>) -> f32 {
    similarities.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::encoder::HashEncoder;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    fn matrix_of(rows: &[Vec<f32>]) -> Array2<f32> {
        let dim = rows[0].len();
        let mut m = Array2::zeros((rows.len(), dim));
        for (i, r) in rows.iter().enumerate() {
            for (j, x) in r.iter().enumerate() {
                m[[i, j]] = *x;
            }
        }
        m
    }

    #[test]
    fn test_similarity_matrix_identity() {
        let a = matrix_of(&[unit(4, 0), unit(4, 1)]);
        let sims = similarity_matrix(&a, &a);
        assert!((sims[[0, 0]] - 1.0).abs() < 1e-6);
        assert!((sims[[1, 1]] - 1.0).abs() < 1e-6);
        assert!(sims[[0, 1]].abs() < 1e-6);
    }

    #[test]
    fn test_similarity_normalises_rows() {
        // Same direction, different magnitude: cosine must be 1.
        let a = matrix_of(&[vec![2.0, 0.0, 0.0, 0.0]]);
        let b = matrix_of(&[vec![0.5, 0.0, 0.0, 0.0]]);
        let sims = similarity_matrix(&a, &b);
        assert!((sims[[0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_max_per_post() {
        let entries = vec![
            IndexEntry { post_id: 1, fragment_index: 0 },
            IndexEntry { post_id: 1, fragment_index: 1 },
            IndexEntry { post_id: 2, fragment_index: 0 },
        ];
        // One query fragment against three index fragments.
        let sims = matrix_of(&[vec![0.2, 0.9, 0.5]]);

        let ranked = max_per_post(&sims, &entries, -1);
        assert_eq!(ranked[0], (1, 0.9));
        assert_eq!(ranked[1], (2, 0.5));
    }

    #[test]
    fn test_max_per_post_skips_the_query_itself() {
        let entries = vec![
            IndexEntry { post_id: 1, fragment_index: 0 },
            IndexEntry { post_id: 2, fragment_index: 0 },
        ];
        let sims = matrix_of(&[vec![1.0, 0.3]]);
        let ranked = max_per_post(&sims, &entries, 1);
        assert_eq!(ranked, vec![(2, 0.3)]);
    }

    #[test]
    fn test_max_scalar() {
        let sims = matrix_of(&[vec![0.1, 0.4], vec![0.8, 0.2]]);
        assert_eq!(max_scalar(&sims), 0.8);
    }

    #[test]
    fn test_snapshot_assembles_in_post_order() {
        let tmp = TempDir::new().unwrap();
        let store =
            EmbeddingStore::new(&tmp.path().join("emb"), Arc::new(HashEncoder)).unwrap();

        store.put(3, "three", "s", "x. y").unwrap(); // 4 fragments
        store.put(1, "one", "s", "").unwrap(); // 2 fragments

        let snap = snapshot(&store).unwrap();
        assert_eq!(snap.entries.len(), 6);
        assert_eq!(snap.matrix.shape(), &[6, 768]);

        // Post 1 first (ids ascend), fragment order preserved.
        assert_eq!(snap.entries[0], IndexEntry { post_id: 1, fragment_index: 0 });
        assert_eq!(snap.entries[1], IndexEntry { post_id: 1, fragment_index: 1 });
        assert_eq!(snap.entries[2], IndexEntry { post_id: 3, fragment_index: 0 });
        assert_eq!(snap.entries[5], IndexEntry { post_id: 3, fragment_index: 3 });
    }

    #[test]
    fn test_empty_snapshot() {
        let tmp = TempDir::new().unwrap();
        let store =
            EmbeddingStore::new(&tmp.path().join("emb"), Arc::new(HashEncoder)).unwrap();
        let snap = snapshot(&store).unwrap();
        assert!(snap.is_empty());
    }
}
