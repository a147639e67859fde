//! Embedding provider trait and local implementations.
//!
//! - `OpenAiEmbedder` (see `openai.rs`): remote OpenAI-compatible API
//! - `HashingEmbedder`: deterministic feature hashing, no network
//! - `CachedEmbedder`: wraps any provider with a `QueryCache`

use std::sync::Arc;

use async_trait::async_trait;
use ndarray::Array1;
use sha2::{Digest, Sha256};

use crate::cache::QueryCache;
use alarmsage_core::Result;

/// Converts text to fixed-width vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Array1<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Array1<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Feature-hashing embedder over lowercase words and character trigrams.
///
/// Texts sharing words or substrings land close together, which is enough
/// for offline use and for tests that need stable vectors.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Array1<f32> {
        let mut v = Array1::<f32>::zeros(self.dim);
        let lower = text.to_lowercase();

        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.add_feature(&mut v, word, 1.0);

            let padded: Vec<char> = format!(" {} ", word).chars().collect();
            for tri in padded.windows(3) {
                let gram: String = tri.iter().collect();
                self.add_feature(&mut v, &gram, 0.5);
            }
        }

        let norm = v.dot(&v).sqrt();
        if norm > 1e-9 {
            v /= norm;
        }
        v
    }

    fn add_feature(&self, v: &mut Array1<f32>, feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(bucket);
        let idx = (h % self.dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Array1<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

/// Memoizes single-text embeddings of an inner provider.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: QueryCache,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: QueryCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    async fn embed(&self, text: &str) -> Result<Array1<f32>> {
        if let Some(hit) = self.cache.get(text) {
            return Ok(hit);
        }
        let embedding = self.inner.embed(text).await?;
        self.cache.put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    /// Batches go straight to the inner provider; they come from indexing
    /// runs whose texts are not repeated as queries.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Array1<f32>>> {
        self.inner.embed_batch(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
