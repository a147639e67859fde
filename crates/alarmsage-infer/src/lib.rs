//! AlarmSage Infer: embedding providers, query cache, rerankers.
//!
//! `create_embedder` picks the remote OpenAI-compatible provider when an API
//! key is configured, otherwise the offline `HashingEmbedder`. Both are
//! wrapped in a `QueryCache`.

pub mod cache;
pub mod embedder;
pub mod http;
pub mod openai;
pub mod rerank;

pub use cache::QueryCache;
pub use embedder::{CachedEmbedder, Embedder, HashingEmbedder};
pub use openai::OpenAiEmbedder;
pub use rerank::{CohereReranker, PassthroughReranker, RerankHit, Reranker};

use std::sync::Arc;

use alarmsage_core::{EmbeddingProviderKind, Error, Result};

/// Build the configured embedder.
///
/// Asking for the OpenAI provider without a key is a configuration error
/// rather than a silent fallback, since stored vectors would not match.
pub fn create_embedder(
    kind: EmbeddingProviderKind,
    dim: usize,
    api_key: Option<&str>,
    base_url: Option<&str>,
) -> Result<Arc<dyn Embedder>> {
    let inner: Arc<dyn Embedder> = match kind {
        EmbeddingProviderKind::OpenAi => {
            let key = api_key.filter(|k| !k.is_empty()).ok_or_else(|| {
                Error::Config("OpenAI embeddings selected but no API key configured".into())
            })?;
            let mut embedder = OpenAiEmbedder::new(key, dim);
            if let Some(url) = base_url {
                embedder = embedder.with_base_url(url);
            }
            tracing::info!("Using OpenAI embedder (model={}, dim={})", embedder.name(), dim);
            Arc::new(embedder)
        }
        EmbeddingProviderKind::Hashing => {
            tracing::info!("Using offline hashing embedder (dim={})", dim);
            Arc::new(HashingEmbedder::new(dim))
        }
    };
    Ok(Arc::new(CachedEmbedder::new(inner, QueryCache::default_cache())))
}

/// Cohere when a key is present, otherwise keep retrieval order.
pub fn create_reranker(cohere_api_key: Option<&str>) -> Arc<dyn Reranker> {
    match cohere_api_key.filter(|k| !k.is_empty()) {
        Some(key) => Arc::new(CohereReranker::new(key)),
        None => {
            tracing::warn!("No Cohere API key configured; manual results will not be reranked");
            Arc::new(PassthroughReranker)
        }
    }
}
