use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;

use crate::error::RelayError;
use crate::state::AppState;
use crate::store::{ChatThread, Role, ThreadId, UserId};

use super::{agent_id_from_value, parse_json_body};

const DEFAULT_THREAD_TITLE: &str = "New Chat";

#[derive(Debug, Deserialize)]
struct CreateThreadBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "agentId")]
    agent_id: Option<serde_json::Value>,
}

/// Load a thread and check it belongs to `user_id`. Foreign threads look missing.
pub(crate) async fn require_owned_thread(
    state: &AppState,
    user_id: UserId,
    thread_id: ThreadId,
) -> Result<ChatThread, RelayError> {
    match state.store.get_thread(thread_id).await? {
        Some(thread) if thread.user_id == user_id => Ok(thread),
        _ => Err(RelayError::NotFound("Thread not found".to_string())),
    }
}

/// `GET /api/chat/threads`
pub async fn list_threads(
    State(state): State<Arc<AppState>>,
    headers: &http::HeaderMap,
) -> Response {
    list_threads_inner(&state, headers)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn list_threads_inner(
    state: &AppState,
    headers: &http::HeaderMap,
) -> Result<Response, RelayError> {
    let user_id = state.authenticate(headers)?;
    let threads = state.store.list_threads(user_id).await?;
    Ok(Json(json!({ "threads": threads })).into_response())
}

/// `POST /api/chat/threads`
pub async fn create_thread(
    State(state): State<Arc<AppState>>,
    headers: &http::HeaderMap,
    body: Bytes,
) -> Response {
    create_thread_inner(&state, headers, &body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn create_thread_inner(
    state: &AppState,
    headers: &http::HeaderMap,
    body: &[u8],
) -> Result<Response, RelayError> {
    let user_id = state.authenticate(headers)?;
    let request: CreateThreadBody = parse_json_body(body)?;
    let agent_id = agent_id_from_value(request.agent_id.as_ref())
        .ok_or_else(|| RelayError::NotFound("Agent not found or inactive".to_string()))?;
    let agent = state.active_agent(agent_id)?;

    let title = request
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or(DEFAULT_THREAD_TITLE);
    let thread_id = state.store.create_thread(user_id, title).await?;

    if let Some(greeting) = agent.greeting.as_deref().filter(|g| !g.trim().is_empty()) {
        state
            .store
            .insert_turn(thread_id, Role::Assistant, greeting)
            .await?;
    }

    tracing::info!(user_id, thread_id, agent_id, "thread created");
    Ok(Json(json!({
        "threadId": thread_id,
        "message": "Thread created successfully",
    }))
    .into_response())
}

/// `GET /api/chat/threads/{threadId}/messages`
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    headers: &http::HeaderMap,
    thread_id: ThreadId,
) -> Response {
    list_messages_inner(&state, headers, thread_id)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn list_messages_inner(
    state: &AppState,
    headers: &http::HeaderMap,
    thread_id: ThreadId,
) -> Result<Response, RelayError> {
    let user_id = state.authenticate(headers)?;
    require_owned_thread(state, user_id, thread_id).await?;
    let messages = state.store.list_turns(thread_id).await?;
    Ok(Json(json!({ "messages": messages })).into_response())
}

/// `DELETE /api/chat/threads/{threadId}`
pub async fn delete_thread(
    State(state): State<Arc<AppState>>,
    headers: &http::HeaderMap,
    thread_id: ThreadId,
) -> Response {
    delete_thread_inner(&state, headers, thread_id)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn delete_thread_inner(
    state: &AppState,
    headers: &http::HeaderMap,
    thread_id: ThreadId,
) -> Result<Response, RelayError> {
    let user_id = state.authenticate(headers)?;
    if !state.store.delete_thread(user_id, thread_id).await? {
        return Err(RelayError::NotFound("Thread not found".to_string()));
    }
    tracing::info!(user_id, thread_id, "thread deleted");
    Ok(Json(json!({ "message": "Thread deleted successfully" })).into_response())
}
