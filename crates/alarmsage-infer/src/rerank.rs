//! Rerankers: reorder retrieved candidates by relevance to a query.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::http::{status_error, transport_error};
use alarmsage_core::{Error, Result};

const SERVICE: &str = "cohere-rerank";

pub const DEFAULT_RERANK_MODEL: &str = "rerank-english-v3.0";
pub const DEFAULT_COHERE_URL: &str = "https://api.cohere.com/v1";

/// One reranked candidate: its index into the input slice and its score.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RerankHit {
    pub index: usize,
    #[serde(rename = "relevance_score")]
    pub score: f64,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Best-first hits, at most `top_n`. Indices refer to `documents`; callers
    /// must not trust them to be in range.
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize)
        -> Result<Vec<RerankHit>>;

    fn name(&self) -> &str;
}

/// Keeps the retrieval order. Used when no rerank credentials are configured.
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    async fn rerank(
        &self,
        _query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>> {
        Ok((0..documents.len().min(top_n))
            .map(|index| RerankHit { index, score: 0.0 })
            .collect())
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankHit>,
}

/// Cohere `/rerank` client.
pub struct CohereReranker {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl CohereReranker {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_COHERE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_RERANK_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>> {
        if documents.is_empty() || top_n == 0 {
            return Ok(Vec::new());
        }

        let request = RerankRequest {
            model: &self.model,
            query,
            documents,
            top_n: top_n.min(documents.len()),
        };
        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        if !response.status().is_success() {
            return Err(status_error(SERVICE, response).await);
        }

        let body: RerankResponse = response
            .json()
            .await
            .map_err(|e| Error::upstream(SERVICE, format!("invalid response: {}", e)))?;
        debug!("Reranked {} candidates to {}", documents.len(), body.results.len());
        Ok(body.results)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
