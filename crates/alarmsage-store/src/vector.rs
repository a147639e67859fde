//! In-memory cosine index over normalized embeddings.

use ndarray::{Array1, Array2, Axis};

use alarmsage_core::{Error, Result};

/// Row-normalized embedding matrix with the row id of each entry.
///
/// Similarity for a query is one matrix-vector product.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dim: usize,
    /// Normalized embeddings, shape (N, dim).
    matrix: Array2<f32>,
    ids: Vec<i64>,
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            matrix: Array2::zeros((0, dim)),
            ids: Vec::new(),
        }
    }

    /// Build from `(id, embedding)` rows. Rows of the wrong width are rejected.
    pub fn from_rows(dim: usize, rows: Vec<(i64, Array1<f32>)>) -> Result<Self> {
        let mut matrix = Array2::zeros((rows.len(), dim));
        let mut ids = Vec::with_capacity(rows.len());
        for (i, (id, emb)) in rows.into_iter().enumerate() {
            check_dim(dim, emb.len())?;
            matrix.row_mut(i).assign(&normalized(emb));
            ids.push(id);
        }
        Ok(Self { dim, matrix, ids })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Insert or replace the entry for `id`.
    pub fn upsert(&mut self, id: i64, embedding: &Array1<f32>) -> Result<()> {
        check_dim(self.dim, embedding.len())?;
        let row = normalized(embedding.clone());
        if let Some(pos) = self.ids.iter().position(|&x| x == id) {
            self.matrix.row_mut(pos).assign(&row);
            return Ok(());
        }
        self.matrix
            .push_row(row.view())
            .map_err(|e| Error::Internal(format!("vector index append failed: {}", e)))?;
        self.ids.push(id);
        Ok(())
    }

    /// Drop the entry for `id`. Returns whether it was present.
    pub fn remove(&mut self, id: i64) -> bool {
        let Some(pos) = self.ids.iter().position(|&x| x == id) else {
            return false;
        };
        let keep: Vec<usize> = (0..self.ids.len()).filter(|&i| i != pos).collect();
        self.matrix = self.matrix.select(Axis(0), &keep);
        self.ids.remove(pos);
        true
    }

    /// Top-`k` ids by cosine similarity, best first.
    pub fn search(&self, query: &Array1<f32>, k: usize) -> Result<Vec<(i64, f32)>> {
        check_dim(self.dim, query.len())?;
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let q_norm = query.dot(query).sqrt();
        if q_norm < 1e-9 {
            return Ok(Vec::new());
        }
        let q = query / q_norm;

        // (N, dim) @ (dim,) → (N,)
        let similarities = self.matrix.dot(&q);

        let mut indexed: Vec<(usize, f32)> = similarities.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed.truncate(k);

        Ok(indexed.into_iter().map(|(i, s)| (self.ids[i], s)).collect())
    }
}

fn check_dim(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::Validation(format!(
            "embedding dimension mismatch: expected {}, got {}",
            expected, got
        )));
    }
    Ok(())
}

fn normalized(mut v: Array1<f32>) -> Array1<f32> {
    let norm = v.dot(&v).sqrt();
    if norm > 1e-9 {
        v /= norm;
    }
    v
}
