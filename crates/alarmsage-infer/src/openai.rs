//! OpenAI-compatible embeddings API client.

use async_trait::async_trait;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedder::Embedder;
use crate::http::{status_error, transport_error};
use alarmsage_core::{Error, Result};

const SERVICE: &str = "openai-embeddings";

pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-large";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    /// Matryoshka truncation; the 3-series models accept any width.
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedder {
    pub fn new(api_key: impl Into<String>, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dims,
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
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Array1<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream(SERVICE, "empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Array1<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dims,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        if !response.status().is_success() {
            return Err(status_error(SERVICE, response).await);
        }

        let mut body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::upstream(SERVICE, format!("invalid response: {}", e)))?;
        body.data.sort_by_key(|d| d.index);

        if body.data.len() != texts.len() {
            return Err(Error::upstream(
                SERVICE,
                format!("expected {} embeddings, got {}", texts.len(), body.data.len()),
            ));
        }
        if let Some(bad) = body.data.iter().find(|d| d.embedding.len() != self.dims) {
            return Err(Error::Consistency(format!(
                "{} returned dimension {}, expected {}",
                self.model,
                bad.embedding.len(),
                self.dims
            )));
        }

        debug!("Embedded {} texts with {}", texts.len(), self.model);
        Ok(body
            .data
            .into_iter()
            .map(|d| Array1::from_vec(d.embedding))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        &self.model
    }
}
