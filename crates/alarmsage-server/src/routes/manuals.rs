//! Manual retrieval routes.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use alarmsage_resolve::ManualContext;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/manuals/models", get(list_models))
        .route("/manuals/retrieve", post(retrieve))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveRequest {
    machine_model: String,
    question: String,
}

/// POST /api/manuals/retrieve: reranked context and page images.
async fn retrieve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RetrieveRequest>,
) -> ApiResult<Json<ManualContext>> {
    if req.question.trim().is_empty() {
        return Err(ApiError::bad_request("question must not be empty"));
    }
    if !state.manuals.registry().contains(&req.machine_model) {
        return Err(ApiError::bad_request(format!(
            "unknown machine model '{}'",
            req.machine_model
        )));
    }
    let context = state
        .manuals
        .retrieve(&req.machine_model, &req.question)
        .await?;
    Ok(Json(context))
}

/// GET /api/manuals/models: machine models with their collections and
/// indexed chunk counts.
async fn list_models(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let registry = state.manuals.registry();
    let mut models = Vec::new();
    for name in registry.models() {
        let mut collections = Vec::new();
        for collection in registry.collections_for(name)? {
            collections.push(serde_json::json!({
                "name": collection,
                "chunks": state.store.count_collection_chunks(collection)?,
            }));
        }
        models.push(serde_json::json!({ "name": name, "collections": collections }));
    }
    Ok(Json(serde_json::Value::Array(models)))
}
