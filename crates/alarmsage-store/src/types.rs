//! Data types for alarms, manual chunks, threads and search results.

use serde::{Deserialize, Serialize};

/// An alarm row from the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRecord {
    pub id: i64,
    pub code: String,
    pub message: String,
    pub desc: String,
    /// Editor.js document serialized as JSON.
    pub solution: Option<String>,
    pub machine_type: String,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
}

impl AlarmRecord {
    /// Text that the alarm's embedding is computed from.
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.code, &self.message, &self.desc)
    }
}

/// Fields supplied when creating or updating an alarm.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAlarm {
    pub code: String,
    pub message: String,
    pub desc: String,
    #[serde(default)]
    pub solution: Option<String>,
    pub machine_type: String,
}

impl NewAlarm {
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.code, &self.message, &self.desc)
    }
}

fn embedding_text(code: &str, message: &str, desc: &str) -> String {
    format!("{} {} {}", code, message, desc)
}

/// Kind of content a manual chunk was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Text,
    Markdown,
    Table,
    Image,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Text => "text",
            MediaType::Markdown => "markdown",
            MediaType::Table => "table",
            MediaType::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MediaType::Text),
            "markdown" => Some(MediaType::Markdown),
            "table" => Some(MediaType::Table),
            "image" => Some(MediaType::Image),
            _ => None,
        }
    }

    /// Chunks whose meaning lives in the rendered page rather than the text.
    pub fn is_visual(&self) -> bool {
        matches!(self, MediaType::Table | MediaType::Image)
    }
}

/// A chunk of a manual stored in a named collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualChunk {
    pub id: i64,
    pub collection: String,
    pub chunk_index: i32,
    pub text: String,
    pub page: i32,
    pub media_type: MediaType,
    pub file_name: String,
}

/// A chunk to be written into a collection, with its embedding.
#[derive(Debug, Clone)]
pub struct NewManualChunk {
    pub text: String,
    pub page: i32,
    pub media_type: MediaType,
    pub file_name: String,
    pub embedding: Vec<f32>,
}

/// A collection chunk returned by nearest-neighbor search.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: ManualChunk,
    /// Cosine similarity to the query.
    pub score: f64,
}

/// Conversation thread metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Snapshot of a thread's messages at a turn boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub thread_id: String,
    /// 1-based turn sequence number.
    pub seq: i64,
    pub messages: Vec<alarmsage_core::Message>,
    pub created_at: i64,
}

/// Store-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_alarms: i64,
    pub alarm_embeddings: i64,
    /// Alarm codes that occur on more than one record.
    pub duplicate_codes: i64,
    pub manual_collections: i64,
    pub manual_chunks: i64,
    pub threads: i64,
    pub embedding_dimension: usize,
    pub db_path: String,
    pub db_size_mb: f64,
}
