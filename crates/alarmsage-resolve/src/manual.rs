//! Manual retrieval: embed the question once, fan out across the machine
//! model's manual collections, rerank the pooled candidates, and attach the
//! page images of visual chunks.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use futures::future::join_all;
use ndarray::Array1;
use serde::Serialize;
use tracing::{debug, info, warn};

use alarmsage_core::retry::{with_backoff, with_timeout};
use alarmsage_core::{Error, ManualCatalog, Result, RetryPolicy, Timeouts};
use alarmsage_infer::{Embedder, Reranker};
use alarmsage_store::{ManualChunk, SqliteStore};

/// Candidates taken from each collection.
pub const RETRIEVE_TOP_K: usize = 10;
/// Chunks kept after reranking.
pub const RERANK_TOP_N: usize = 10;

/// Machine model → ordered collection names. Built once at startup and
/// shared read-only.
#[derive(Debug, Clone, Default)]
pub struct RetrieverRegistry {
    models: BTreeMap<String, Vec<String>>,
}

impl RetrieverRegistry {
    pub fn from_catalog(catalog: &ManualCatalog) -> Self {
        let models = catalog
            .model_names()
            .filter_map(|m| Some((m.to_string(), catalog.collections_for(m)?)))
            .collect();
        Self { models }
    }

    pub fn collections_for(&self, machine_model: &str) -> Result<&[String]> {
        self.models
            .get(machine_model)
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                Error::Config(format!("unknown machine model '{}'", machine_model))
            })
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(|s| s.as_str())
    }

    pub fn contains(&self, machine_model: &str) -> bool {
        self.models.contains_key(machine_model)
    }
}

/// Retrieved context for one question.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ManualContext {
    /// Reranked chunk texts joined by blank lines.
    pub context: String,
    /// `data:image/jpeg;base64,...` URLs of the pages behind visual chunks.
    pub images: Vec<String>,
}

/// Source of rendered manual pages.
#[async_trait]
pub trait PageImageSource: Send + Sync {
    /// JPEG bytes for a page, or `None` if the page was never rendered.
    async fn load(&self, file_name: &str, page: i32) -> Result<Option<Vec<u8>>>;
}

/// Pages rendered to `{images_dir}/{file_stem}/page-{n}.jpg`.
pub struct FsPageImages {
    images_dir: PathBuf,
}

impl FsPageImages {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
        }
    }

    pub fn page_path(&self, file_name: &str, page: i32) -> PathBuf {
        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.to_string());
        self.images_dir.join(stem).join(format!("page-{}.jpg", page))
    }
}

#[async_trait]
impl PageImageSource for FsPageImages {
    async fn load(&self, file_name: &str, page: i32) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.page_path(file_name, page)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

pub struct ManualRetriever {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
    registry: Arc<RetrieverRegistry>,
    images: Arc<dyn PageImageSource>,
    timeouts: Timeouts,
    retry: RetryPolicy,
}

impl ManualRetriever {
    pub fn new(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        registry: Arc<RetrieverRegistry>,
        images: Arc<dyn PageImageSource>,
        timeouts: Timeouts,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
            registry,
            images,
            timeouts,
            retry,
        }
    }

    pub fn registry(&self) -> &RetrieverRegistry {
        &self.registry
    }

    pub async fn retrieve(&self, machine_model: &str, question: &str) -> Result<ManualContext> {
        // Unknown model fails before any I/O.
        let collections = self.registry.collections_for(machine_model)?;
        if collections.is_empty() {
            return Ok(ManualContext::default());
        }

        let embedding = self.embed(question).await?;
        let candidates = self.gather(collections, &embedding).await?;
        if candidates.is_empty() {
            debug!("No manual chunks matched for model '{}'", machine_model);
            return Ok(ManualContext::default());
        }

        let ranked = self.rerank(question, candidates).await;
        let context = ranked
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let images = self.page_images(&ranked).await;

        info!(
            "Manual retrieval for '{}': {} chunks, {} images",
            machine_model,
            ranked.len(),
            images.len()
        );
        Ok(ManualContext { context, images })
    }

    async fn embed(&self, question: &str) -> Result<Array1<f32>> {
        let limit = self.timeouts.embedding();
        with_backoff(&self.retry, "manual question embedding", || {
            with_timeout("manual question embedding", limit, self.embedder.embed(question))
        })
        .await
    }

    /// Top-K from every collection concurrently, flattened in collection
    /// order then rank. Failed collections are skipped; all failing is an error.
    async fn gather(
        &self,
        collections: &[String],
        embedding: &Array1<f32>,
    ) -> Result<Vec<ManualChunk>> {
        let limit = self.timeouts.retrieval();
        let lookups = collections.iter().map(|name| {
            let store = self.store.clone();
            let name = name.clone();
            let embedding = embedding.clone();
            let retry = self.retry.clone();
            async move {
                let result = with_backoff(&retry, "manual collection retrieval", || {
                    let store = store.clone();
                    let name = name.clone();
                    let embedding = embedding.clone();
                    with_timeout("manual collection retrieval", limit, async move {
                        tokio::task::spawn_blocking(move || {
                            store.search_collection(&name, &embedding, RETRIEVE_TOP_K)
                        })
                        .await
                        .map_err(|e| Error::Internal(format!("retrieval task failed: {}", e)))?
                    })
                })
                .await;
                (name, result)
            }
        });

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in join_all(lookups).await {
            match result {
                Ok(hits) => candidates.extend(hits.into_iter().map(|h| h.chunk)),
                Err(e) => {
                    warn!("Retrieval from collection '{}' failed: {}", name, e);
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if failures.len() == collections.len() {
            return Err(Error::upstream(
                "manual-retrieval",
                format!("all collections failed ({})", failures.join("; ")),
            ));
        }
        Ok(candidates)
    }

    /// Rerank pooled candidates; on any reranker problem keep retrieval order.
    async fn rerank(&self, question: &str, candidates: Vec<ManualChunk>) -> Vec<ManualChunk> {
        let documents: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        let limit = self.timeouts.rerank();
        let result = with_backoff(&self.retry, "manual rerank", || {
            with_timeout(
                "manual rerank",
                limit,
                self.reranker.rerank(question, &documents, RERANK_TOP_N),
            )
        })
        .await;

        let order = match result {
            Ok(hits) => {
                let mut seen = HashSet::new();
                let valid = hits
                    .iter()
                    .all(|h| h.index < candidates.len() && seen.insert(h.index));
                if valid {
                    Some(hits.into_iter().map(|h| h.index).collect::<Vec<_>>())
                } else {
                    warn!(
                        "Reranker {} returned indices outside the {} candidates; keeping retrieval order",
                        self.reranker.name(),
                        candidates.len()
                    );
                    None
                }
            }
            Err(e) => {
                warn!("Rerank failed ({}); keeping retrieval order", e);
                None
            }
        };

        match order {
            Some(indices) => {
                let mut slots: Vec<Option<ManualChunk>> = candidates.into_iter().map(Some).collect();
                indices
                    .into_iter()
                    .take(RERANK_TOP_N)
                    .filter_map(|i| slots[i].take())
                    .collect()
            }
            None => candidates.into_iter().take(RERANK_TOP_N).collect(),
        }
    }

    /// One image per distinct (file, page) among table/image chunks.
    async fn page_images(&self, chunks: &[ManualChunk]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut images = Vec::new();
        for chunk in chunks.iter().filter(|c| c.media_type.is_visual()) {
            if !seen.insert((chunk.file_name.as_str(), chunk.page)) {
                continue;
            }
            match self.images.load(&chunk.file_name, chunk.page).await {
                Ok(Some(bytes)) => images.push(format!(
                    "data:image/jpeg;base64,{}",
                    base64::engine::general_purpose::STANDARD.encode(bytes)
                )),
                Ok(None) => debug!("No page image for {} page {}", chunk.file_name, chunk.page),
                Err(e) => warn!(
                    "Failed to load page image for {} page {}: {}",
                    chunk.file_name, chunk.page, e
                ),
            }
        }
        images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        chunk, raw_sql, test_store, CountingEmbedder, FailingEmbedder, FixedReranker, MemoryImages,
        TEST_DIM,
    };
    use alarmsage_infer::{HashingEmbedder, PassthroughReranker, RerankHit};
    use alarmsage_store::MediaType;

    fn registry() -> Arc<RetrieverRegistry> {
        let mut models = BTreeMap::new();
        models.insert(
            "Model A".to_string(),
            vec!["manual-1.pdf".to_string(), "manual-2.pdf".to_string()],
        );
        models.insert("Model B".to_string(), vec!["manual-3.pdf".to_string()]);
        Arc::new(RetrieverRegistry::from_catalog(&ManualCatalog { models }))
    }

    fn retriever(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
        images: Arc<dyn PageImageSource>,
    ) -> ManualRetriever {
        ManualRetriever::new(
            store,
            embedder,
            reranker,
            registry(),
            images,
            Timeouts::default(),
            RetryPolicy::none(),
        )
    }

    fn seed(store: &SqliteStore) {
        store
            .replace_collection(
                "manual-1",
                &[
                    chunk("spindle overheat: check the fan", 12, MediaType::Text, "manual-1.pdf"),
                    chunk("spindle alarm table", 13, MediaType::Table, "manual-1.pdf"),
                    chunk("spindle wiring diagram", 13, MediaType::Image, "manual-1.pdf"),
                ],
            )
            .unwrap();
        store
            .replace_collection(
                "manual-2",
                &[chunk("spindle lubrication schedule", 4, MediaType::Text, "manual-2.pdf")],
            )
            .unwrap();
        store
            .replace_collection(
                "manual-3",
                &[chunk("model b only content", 1, MediaType::Text, "manual-3.pdf")],
            )
            .unwrap();
    }

    #[test]
    fn test_registry_maps_files_to_collections() {
        let reg = registry();
        assert_eq!(reg.collections_for("Model A").unwrap(), ["manual-1", "manual-2"]);
        assert!(matches!(reg.collections_for("Model Z"), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_model_fails_without_io() {
        let (store, _dir) = test_store();
        let embedder = Arc::new(CountingEmbedder::new());
        let r = retriever(
            store,
            embedder.clone(),
            Arc::new(PassthroughReranker),
            Arc::new(MemoryImages::default()),
        );
        let err = r.retrieve("Model Z", "anything").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_only_model_collections_are_searched() {
        let (store, _dir) = test_store();
        seed(&store);
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM)),
            Arc::new(PassthroughReranker),
            Arc::new(MemoryImages::default()),
        );

        let ctx = r.retrieve("Model A", "spindle overheat").await.unwrap();
        assert!(ctx.context.contains("spindle overheat: check the fan"));
        assert!(ctx.context.contains("spindle lubrication schedule"));
        assert!(!ctx.context.contains("model b only content"));
        assert_eq!(ctx.context.split("\n\n").count(), 4);
    }

    #[tokio::test]
    async fn test_rerank_order_is_applied() {
        let (store, _dir) = test_store();
        seed(&store);
        // Candidates: manual-1 (3 chunks) then manual-2 (1 chunk).
        let reranker = FixedReranker::new(vec![
            RerankHit { index: 3, score: 0.9 },
            RerankHit { index: 0, score: 0.5 },
        ]);
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM)),
            Arc::new(reranker),
            Arc::new(MemoryImages::default()),
        );

        let ctx = r.retrieve("Model A", "spindle").await.unwrap();
        let parts: Vec<&str> = ctx.context.split("\n\n").collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "spindle lubrication schedule");
    }

    #[tokio::test]
    async fn test_out_of_range_rerank_falls_back() {
        let (store, _dir) = test_store();
        seed(&store);
        let reranker = FixedReranker::new(vec![RerankHit { index: 99, score: 1.0 }]);
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM)),
            Arc::new(reranker),
            Arc::new(MemoryImages::default()),
        );

        let ctx = r.retrieve("Model A", "spindle").await.unwrap();
        assert_eq!(ctx.context.split("\n\n").count(), 4);
    }

    #[tokio::test]
    async fn test_failing_reranker_falls_back() {
        let (store, _dir) = test_store();
        seed(&store);
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM)),
            Arc::new(FixedReranker::failing()),
            Arc::new(MemoryImages::default()),
        );
        let ctx = r.retrieve("Model A", "spindle").await.unwrap();
        assert_eq!(ctx.context.split("\n\n").count(), 4);
    }

    #[tokio::test]
    async fn test_images_deduplicated_per_page() {
        let (store, _dir) = test_store();
        seed(&store);
        let images = MemoryImages::default().with_page("manual-1.pdf", 13, vec![0xFF, 0xD8]);
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM)),
            Arc::new(PassthroughReranker),
            Arc::new(images),
        );

        let ctx = r.retrieve("Model A", "spindle").await.unwrap();
        // Table and image chunk share page 13; the text chunk on page 12 has no image.
        assert_eq!(ctx.images, vec!["data:image/jpeg;base64,/9g=".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_collections_are_success() {
        let (store, _dir) = test_store();
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM)),
            Arc::new(FixedReranker::failing()),
            Arc::new(MemoryImages::default()),
        );
        let ctx = r.retrieve("Model A", "spindle").await.unwrap();
        assert_eq!(ctx, ManualContext::default());
    }

    #[tokio::test]
    async fn test_embedding_failure_propagates() {
        let (store, _dir) = test_store();
        seed(&store);
        let r = retriever(
            store,
            Arc::new(FailingEmbedder),
            Arc::new(PassthroughReranker),
            Arc::new(MemoryImages::default()),
        );
        assert!(r.retrieve("Model A", "spindle").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_collection_beside_populated_one() {
        let (store, _dir) = test_store();
        store
            .replace_collection(
                "manual-1",
                &[chunk("parameter enable switch: set PWE to 0", 40, MediaType::Text, "manual-1.pdf")],
            )
            .unwrap();
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM)),
            Arc::new(PassthroughReranker),
            Arc::new(MemoryImages::default()),
        );

        let ctx = r.retrieve("Model A", "parameter enable switch").await.unwrap();
        assert_eq!(ctx.context, "parameter enable switch: set PWE to 0");
    }

    #[tokio::test]
    async fn test_one_failing_collection_is_skipped() {
        let (store, dir) = test_store();
        seed(&store);
        raw_sql(
            dir.path(),
            "UPDATE manual_chunks SET media_type = 'hologram' WHERE collection = 'manual-2'",
        );
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM)),
            Arc::new(PassthroughReranker),
            Arc::new(MemoryImages::default()),
        );

        let ctx = r.retrieve("Model A", "spindle").await.unwrap();
        assert!(ctx.context.contains("spindle overheat: check the fan"));
        assert!(!ctx.context.contains("lubrication"));
        assert_eq!(ctx.context.split("\n\n").count(), 3);
    }

    #[tokio::test]
    async fn test_all_collections_failing_is_upstream_error() {
        let (store, _dir) = test_store();
        // Query width differs from the store's, so every collection lookup fails.
        let r = retriever(
            store,
            Arc::new(HashingEmbedder::new(TEST_DIM + 1)),
            Arc::new(PassthroughReranker),
            Arc::new(MemoryImages::default()),
        );
        let err = r.retrieve("Model A", "spindle").await.unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));
    }

    #[test]
    fn test_fs_page_path() {
        let src = FsPageImages::new("/data/manuals/images");
        assert_eq!(
            src.page_path("63942EN.pdf", 7),
            PathBuf::from("/data/manuals/images/63942EN/page-7.jpg")
        );
    }

    #[tokio::test]
    async fn test_fs_missing_page_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let src = FsPageImages::new(dir.path());
        assert!(src.load("x.pdf", 1).await.unwrap().is_none());

        std::fs::create_dir_all(dir.path().join("x")).unwrap();
        std::fs::write(dir.path().join("x").join("page-1.jpg"), b"jpg").unwrap();
        assert_eq!(src.load("x.pdf", 1).await.unwrap(), Some(b"jpg".to_vec()));
    }
}
