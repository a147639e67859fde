//! Alarm knowledge-base routes: hybrid search, CRUD, pinning.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use alarmsage_core::retry::{with_backoff, with_timeout};
use alarmsage_resolve::AlarmQuery;
use alarmsage_store::{AlarmRecord, NewAlarm};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/alarms", get(list_alarms).post(create_alarm))
        .route("/alarms/search", get(search_alarms))
        .route("/alarms/pinned", get(pinned_alarms))
        .route(
            "/alarms/{id}",
            get(get_alarm).put(update_alarm).delete(delete_alarm),
        )
        .route("/alarms/{id}/pin", post(toggle_pin))
}

// ---------------------------------------------------------------
// Search
// ---------------------------------------------------------------

/// GET /api/alarms/search?code=&message=&description=&limit=
async fn search_alarms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlarmQuery>,
) -> ApiResult<Json<Vec<AlarmRecord>>> {
    let alarms = state.alarm_search.search(&query).await?;
    Ok(Json(alarms))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    search: Option<String>,
    machine_type: Option<String>,
    limit: Option<i64>,
}

/// GET /api/alarms?search=&machineType=&limit=
async fn list_alarms(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<AlarmRecord>>> {
    let alarms = state.store.list_alarms(
        params.search.as_deref(),
        params.machine_type.as_deref(),
        params.limit.unwrap_or(-1),
    )?;
    Ok(Json(alarms))
}

// ---------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------

fn validate(alarm: &NewAlarm) -> ApiResult<()> {
    if alarm.code.trim().is_empty() {
        return Err(ApiError::bad_request("code must not be empty"));
    }
    if alarm.machine_type.trim().is_empty() {
        return Err(ApiError::bad_request("machineType must not be empty"));
    }
    Ok(())
}

/// Embedding for a created or edited alarm, under the same retry and
/// timeout policy as query embeddings.
async fn embed_alarm(state: &AppState, alarm: &NewAlarm) -> ApiResult<Vec<f32>> {
    let text = alarm.embedding_text();
    let limit = state.config.timeouts.embedding();
    let embedding = with_backoff(&state.config.retry, "alarm embedding", || {
        with_timeout("alarm embedding", limit, state.embedder.embed(&text))
    })
    .await?;
    Ok(embedding.to_vec())
}

async fn get_alarm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<AlarmRecord>> {
    state
        .store
        .get_alarm(id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("alarm {}", id)))
}

async fn create_alarm(
    State(state): State<Arc<AppState>>,
    Json(alarm): Json<NewAlarm>,
) -> ApiResult<(StatusCode, Json<AlarmRecord>)> {
    validate(&alarm)?;
    let embedding = embed_alarm(&state, &alarm).await?;
    let created = state.store.create_alarm(&alarm, &embedding)?;
    info!("Created alarm {} ({})", created.id, created.code);
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_alarm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(alarm): Json<NewAlarm>,
) -> ApiResult<Json<AlarmRecord>> {
    validate(&alarm)?;
    let embedding = embed_alarm(&state, &alarm).await?;
    let updated = state.store.update_alarm(id, &alarm, &embedding)?;
    Ok(Json(updated))
}

async fn delete_alarm(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if state.store.delete_alarm(id)? {
        info!("Deleted alarm {}", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("alarm {}", id)))
    }
}

// ---------------------------------------------------------------
// Pinning
// ---------------------------------------------------------------

/// POST /api/alarms/{id}/pin: flips the pin and reports the new state.
async fn toggle_pin(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let pinned = state.store.toggle_pinned(id)?;
    Ok(Json(serde_json::json!({ "id": id, "pinned": pinned })))
}

async fn pinned_alarms(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<AlarmRecord>>> {
    Ok(Json(state.store.pinned_alarms()?))
}
