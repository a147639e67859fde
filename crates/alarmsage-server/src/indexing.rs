//! Offline indexing: parsed manuals and page-image summaries into
//! collections, alarm embeddings. Also runs a startup catch-up for alarms
//! stored without an embedding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use alarmsage_chat::{ChatMessage, ChatModel, ModelRequest};
use alarmsage_core::config::collection_name;
use alarmsage_core::retry::with_timeout;
use alarmsage_core::{Error, Result, Timeouts};
use alarmsage_infer::Embedder;
use alarmsage_store::{MediaType, NewManualChunk, SqliteStore};

/// Alarms embedded per batch call.
const EMBED_BATCH: usize = 32;
/// Page images summarised at once.
const IMAGE_CONCURRENCY: usize = 5;

pub const IMAGE_SUMMARY_PROMPT: &str = "Generate a summary of the image as alt text. \
Extract keywords from the image if there are keywords. The keywords should be from the image, \
not from the summary generated. Keep the summary concise. Return the answer in plain text. \
Do not return markdown.";

static EXTRA_WHITESPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s{2,}").expect("whitespace pattern"));
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s").expect("heading pattern"));

// ---------------------------------------------------------------
// Parsed manual format
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ParsedDocument {
    #[serde(default)]
    pages: Vec<ParsedPage>,
}

#[derive(Debug, Deserialize)]
struct ParsedPage {
    page: i32,
    #[serde(default)]
    text: String,
    #[serde(default)]
    md: String,
    #[serde(default)]
    items: Vec<ParsedItem>,
}

#[derive(Debug, Deserialize)]
struct ParsedItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

/// A chunk before embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct PageChunk {
    pub text: String,
    pub page: i32,
    pub media_type: MediaType,
}

/// Parse the parser's JSON output (an array whose first element holds
/// `pages`) into chunks: one text chunk per page, one markdown chunk per
/// heading section, one table chunk per row.
pub fn parse_manual(json: &str) -> Result<Vec<PageChunk>> {
    let documents: Vec<ParsedDocument> = serde_json::from_str(json)?;
    let document = documents
        .into_iter()
        .next()
        .ok_or_else(|| Error::Validation("parsed manual contains no documents".into()))?;

    let mut chunks = Vec::new();
    for page in document.pages {
        let text = EXTRA_WHITESPACE.replace_all(&page.text, " ");
        if !text.trim().is_empty() {
            chunks.push(PageChunk {
                text: text.into_owned(),
                page: page.page,
                media_type: MediaType::Text,
            });
        }

        for section in markdown_sections(&page.md) {
            chunks.push(PageChunk {
                text: section,
                page: page.page,
                media_type: MediaType::Markdown,
            });
        }

        for item in page.items.iter().filter(|i| i.kind == "table") {
            for row in &item.rows {
                let text = row.iter().map(cell_text).collect::<Vec<_>>().join(" ");
                if !text.trim().is_empty() {
                    chunks.push(PageChunk {
                        text,
                        page: page.page,
                        media_type: MediaType::Table,
                    });
                }
            }
        }
    }
    Ok(chunks)
}

fn cell_text(cell: &serde_json::Value) -> String {
    match cell {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Split markdown at headings; a heading starts a new section and stays
/// with it. Headings inside fenced code blocks are ignored.
pub fn markdown_sections(md: &str) -> Vec<String> {
    let mut sections = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in md.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence && HEADING.is_match(line) && !current.trim().is_empty() {
            sections.push(current.trim().to_string());
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        sections.push(current.trim().to_string());
    }
    sections
}

// ---------------------------------------------------------------
// Page images
// ---------------------------------------------------------------

/// Where page images live and who describes them.
pub struct PageImageSummaries<'a> {
    pub model: &'a dyn ChatModel,
    /// Holds one `{stem}/page-{n}.jpg` directory per manual.
    pub images_dir: &'a Path,
    pub timeouts: &'a Timeouts,
}

/// `page-{n}.jpg` files in `dir`, by page. A missing directory has none.
pub fn page_image_files(dir: &Path) -> Result<Vec<(i32, PathBuf)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut pages = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let page = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("page-"))
            .and_then(|n| n.strip_suffix(".jpg"))
            .and_then(|n| n.parse::<i32>().ok());
        if let Some(page) = page {
            pages.push((page, path));
        }
    }
    pages.sort();
    Ok(pages)
}

/// One image chunk per page image the model could describe. Pages whose
/// summary fails or comes back empty are skipped.
pub async fn summarise_page_images(
    model: &dyn ChatModel,
    dir: &Path,
    timeouts: &Timeouts,
) -> Result<Vec<PageChunk>> {
    let pages = page_image_files(dir)?;
    if pages.is_empty() {
        debug!("No page images under {}", dir.display());
        return Ok(Vec::new());
    }
    info!("Summarising {} page images from {}", pages.len(), dir.display());

    let limit = timeouts.model_first_chunk();
    let chunks: Vec<Option<PageChunk>> = futures::stream::iter(pages)
        .map(|(page, path)| async move {
            match summarise_page(model, &path, limit).await {
                Ok(text) if !text.trim().is_empty() => Some(PageChunk {
                    text: text.trim().to_string(),
                    page,
                    media_type: MediaType::Image,
                }),
                Ok(_) => {
                    warn!("Empty summary for {}", path.display());
                    None
                }
                Err(e) => {
                    warn!("Could not summarise {}: {}", path.display(), e);
                    None
                }
            }
        })
        .buffered(IMAGE_CONCURRENCY)
        .collect()
        .await;
    Ok(chunks.into_iter().flatten().collect())
}

async fn summarise_page(model: &dyn ChatModel, path: &Path, limit: Duration) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let url = format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    );
    let request = ModelRequest::new(vec![ChatMessage::user_with_images(
        IMAGE_SUMMARY_PROMPT,
        vec![url],
    )]);
    with_timeout("page image summary", limit, model.complete(request)).await
}

// ---------------------------------------------------------------
// Manual collections
// ---------------------------------------------------------------

/// Index one parsed manual, replacing its collection. The collection is
/// named after the file stem and chunks reference `{stem}.pdf`. With
/// `images`, summaries of the manual's page images are indexed alongside.
pub async fn index_manual(
    store: &SqliteStore,
    embedder: &dyn Embedder,
    path: &Path,
    images: Option<&PageImageSummaries<'_>>,
) -> Result<usize> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Validation(format!("not a file: {}", path.display())))?;
    let collection = collection_name(file_name);
    let json = tokio::fs::read_to_string(path).await?;
    let mut chunks = parse_manual(&json)?;
    if let Some(images) = images {
        let dir = images.images_dir.join(&collection);
        chunks.extend(summarise_page_images(images.model, &dir, images.timeouts).await?);
    }
    info!("Indexing {} ({} chunks)", collection, chunks.len());

    let pdf_name = format!("{}.pdf", collection);
    let mut rows = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(EMBED_BATCH) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embeddings = embedder.embed_batch(&texts).await?;
        for (chunk, embedding) in batch.iter().zip(embeddings) {
            rows.push(NewManualChunk {
                text: chunk.text.clone(),
                page: chunk.page,
                media_type: chunk.media_type,
                file_name: pdf_name.clone(),
                embedding: embedding.to_vec(),
            });
        }
        debug!("Embedded {}/{} chunks", rows.len(), chunks.len());
    }

    let written = store.replace_collection(&collection, &rows)?;
    info!("Collection {} now holds {} chunks", collection, written);
    Ok(written)
}

// ---------------------------------------------------------------
// Alarm embeddings
// ---------------------------------------------------------------

/// Recompute alarm embeddings. With `all = false` only alarms missing one
/// are embedded. Returns the number of alarms updated.
pub async fn reembed_alarms(
    store: &SqliteStore,
    embedder: &dyn Embedder,
    all: bool,
) -> Result<usize> {
    let ids = if all {
        store
            .list_alarms(None, None, -1)?
            .into_iter()
            .map(|a| a.id)
            .collect()
    } else {
        store.alarms_without_embedding()?
    };
    if ids.is_empty() {
        return Ok(0);
    }

    let mut updated = 0;
    for batch in ids.chunks(EMBED_BATCH) {
        let alarms = store.get_alarms(batch)?;
        let texts: Vec<String> = alarms.iter().map(|a| a.embedding_text()).collect();
        let embeddings = embedder.embed_batch(&texts).await?;
        for (alarm, embedding) in alarms.iter().zip(embeddings) {
            store.set_alarm_embedding(alarm.id, &embedding.to_vec())?;
            updated += 1;
        }
    }
    info!("Embedded {} alarms", updated);
    Ok(updated)
}

/// Embed alarms left without a vector by an earlier session.
pub fn start_embedding_catchup(store: Arc<SqliteStore>, embedder: Arc<dyn Embedder>) {
    tokio::spawn(async move {
        match reembed_alarms(&store, embedder.as_ref(), false).await {
            Ok(0) => debug!("No alarms pending embedding"),
            Ok(n) => info!("Catch-up embedded {} alarms", n),
            Err(e) if e.is_retryable() => warn!("Alarm embedding catch-up deferred: {}", e),
            Err(e) => error!("Alarm embedding catch-up failed: {}", e),
        }
    });
}
