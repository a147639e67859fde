//! Chat routes: agent turns streamed over SSE, plus thread history.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use alarmsage_core::message::{new_thread_id, visible_messages, VisibleMessage};
use alarmsage_runtime::{TurnEvent, TurnRequest};
use alarmsage_store::ThreadSummary;

type SseStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat/threads", get(list_threads))
        .route("/chat/threads/{id}", axum::routing::delete(delete_thread))
        .route("/chat/threads/{id}/messages", get(thread_messages))
}

// ---------------------------------------------------------------
// Streaming turn
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub question: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Machine model whose manuals the turn may consult.
    #[serde(default)]
    pub model: Option<String>,
}

/// POST /api/chat: run one agent turn.
///
/// Request problems are rejected before the stream opens. Once streaming,
/// each text delta is one `response` event and a terminal failure is one
/// `error` event. Dropping the response cancels the turn.
async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<KeepAliveStream<SseStream>>> {
    let question = req.question.trim();
    if question.is_empty() {
        return Err(ApiError::bad_request("question must not be empty"));
    }
    let machine_model = state.agent.resolve_machine_model(req.model.as_deref())?;
    let thread_id = req
        .thread_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_thread_id);

    info!("Chat turn on thread {} ({})", thread_id, machine_model);
    let mut events = state.agent.stream_turn(TurnRequest {
        thread_id: thread_id.clone(),
        question: question.to_string(),
        machine_model,
    });

    let stream: SseStream = Box::pin(async_stream::stream! {
        while let Some(event) = events.recv().await {
            match event {
                TurnEvent::Delta(frame) => {
                    match Event::default().event("response").json_data(&frame) {
                        Ok(event) => yield Ok::<_, Infallible>(event),
                        Err(e) => warn!("Dropping unserializable frame: {}", e),
                    }
                }
                TurnEvent::Completed(outcome) => {
                    info!(
                        "Thread {} checkpointed at seq {}",
                        outcome.thread_id, outcome.seq
                    );
                    break;
                }
                TurnEvent::Failed(e) => {
                    let payload = serde_json::json!({
                        "threadId": thread_id,
                        "error": e.kind(),
                        "message": e.to_string(),
                    });
                    yield Ok(Event::default().event("error").data(payload.to_string()));
                    break;
                }
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------
// Threads
// ---------------------------------------------------------------

async fn list_threads(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ThreadSummary>>> {
    Ok(Json(state.store.list_threads()?))
}

/// GET /api/chat/threads/{id}/messages: what the chat UI shows.
async fn thread_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<VisibleMessage>>> {
    if state.store.get_thread(&id)?.is_none() {
        return Err(ApiError::not_found(format!("thread {}", id)));
    }
    let messages = state.store.thread_messages(&id)?;
    Ok(Json(visible_messages(&messages)))
}

async fn delete_thread(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.store.delete_thread(&id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("thread {}", id)))
    }
}
