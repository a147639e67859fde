//! Health and storage statistics routes.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::error::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats", get(get_stats))
}

/// GET /api/health: liveness plus which backends are wired in.
async fn get_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let alarms = state.store.count_alarms().ok();
    Json(serde_json::json!({
        "status": if alarms.is_some() { "healthy" } else { "degraded" },
        "service": "alarmsage",
        "chatModel": state.chat_model,
        "embedder": state.embedder.name(),
        "embeddingDimension": state.config.embedding_dim,
        "alarms": alarms.unwrap_or(0),
        "machineModels": state.manuals.registry().models().collect::<Vec<_>>(),
    }))
}

/// GET /api/stats: storage statistics.
async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let stats = state.store.get_stats()?;
    Ok(Json(serde_json::json!({
        "alarms": stats.total_alarms,
        "alarmEmbeddings": stats.alarm_embeddings,
        "duplicateCodes": stats.duplicate_codes,
        "manualCollections": stats.manual_collections,
        "manualChunks": stats.manual_chunks,
        "threads": stats.threads,
        "embeddingDimension": stats.embedding_dimension,
        "dbSizeMb": stats.db_size_mb,
    })))
}
