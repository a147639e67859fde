//! Fakes shared by the resolver tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array1;

use crate::manual::PageImageSource;
use alarmsage_core::{Error, Result};
use alarmsage_infer::{Embedder, HashingEmbedder, RerankHit, Reranker};
use alarmsage_store::{MediaType, NewAlarm, NewManualChunk, SqliteStore};

pub const TEST_DIM: usize = 32;

pub fn test_store() -> (Arc<SqliteStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path(), TEST_DIM).unwrap();
    (Arc::new(store), dir)
}

/// Write straight to the database file behind a store opened at `dir`,
/// bypassing the store's own bookkeeping.
pub fn raw_sql(dir: &Path, sql: &str) {
    let conn = rusqlite::Connection::open(dir.join("alarmsage.db")).unwrap();
    conn.execute_batch(sql).unwrap();
}

pub fn alarm(code: &str, message: &str, desc: &str) -> NewAlarm {
    NewAlarm {
        code: code.into(),
        message: message.into(),
        desc: desc.into(),
        solution: None,
        machine_type: "Model A".into(),
    }
}

pub fn chunk(text: &str, page: i32, media_type: MediaType, file_name: &str) -> NewManualChunk {
    NewManualChunk {
        text: text.into(),
        page,
        media_type,
        file_name: file_name.into(),
        embedding: HashingEmbedder::new(TEST_DIM).embed_sync(text).to_vec(),
    }
}

pub struct CountingEmbedder {
    calls: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Array1<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Array1::ones(TEST_DIM))
    }
    fn dimension(&self) -> usize {
        TEST_DIM
    }
    fn name(&self) -> &str {
        "counting"
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Array1<f32>> {
        Err(Error::upstream("embeddings", "connection reset"))
    }
    fn dimension(&self) -> usize {
        TEST_DIM
    }
    fn name(&self) -> &str {
        "failing"
    }
}

pub struct SlowEmbedder;

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, _text: &str) -> Result<Array1<f32>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Array1::ones(TEST_DIM))
    }
    fn dimension(&self) -> usize {
        TEST_DIM
    }
    fn name(&self) -> &str {
        "slow"
    }
}

/// Returns a fixed answer regardless of input.
pub struct FixedReranker {
    hits: Option<Vec<RerankHit>>,
}

impl FixedReranker {
    pub fn new(hits: Vec<RerankHit>) -> Self {
        Self { hits: Some(hits) }
    }

    pub fn failing() -> Self {
        Self { hits: None }
    }
}

#[async_trait]
impl Reranker for FixedReranker {
    async fn rerank(
        &self,
        _query: &str,
        _documents: &[String],
        _top_n: usize,
    ) -> Result<Vec<RerankHit>> {
        self.hits
            .clone()
            .ok_or_else(|| Error::upstream("rerank", "503 service unavailable"))
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[derive(Default)]
pub struct MemoryImages {
    pages: HashMap<(String, i32), Vec<u8>>,
}

impl MemoryImages {
    pub fn with_page(mut self, file_name: &str, page: i32, bytes: Vec<u8>) -> Self {
        self.pages.insert((file_name.to_string(), page), bytes);
        self
    }
}

#[async_trait]
impl PageImageSource for MemoryImages {
    async fn load(&self, file_name: &str, page: i32) -> Result<Option<Vec<u8>>> {
        Ok(self.pages.get(&(file_name.to_string(), page)).cloned())
    }
}
