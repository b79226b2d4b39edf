use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::agents::build_completion_request;
use crate::config::AgentConfig;
use crate::error::RelayError;
use crate::observability::log_session_complete;
use crate::relay::{drive_session, sse_response, DownstreamEmitter, StreamSession};
use crate::state::AppState;
use crate::store::{Role, ThreadId, UserId};
use crate::transport::{CompletionRequest, FallbackContext};

use super::threads::require_owned_thread;
use super::{agent_id_from_value, parse_json_body};

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "agentId")]
    agent_id: Option<serde_json::Value>,
}

/// A validated send: the user turn is already stored.
struct PreparedSend {
    user_id: UserId,
    agent: Arc<AgentConfig>,
    request: CompletionRequest,
}

async fn prepare_send(
    state: &AppState,
    headers: &http::HeaderMap,
    thread_id: ThreadId,
    body: &[u8],
    stream: bool,
) -> Result<PreparedSend, RelayError> {
    let user_id = state.authenticate(headers)?;
    let request: SendMessageBody = parse_json_body(body)?;
    let content = request.content.filter(|content| !content.trim().is_empty());
    let agent_id = agent_id_from_value(request.agent_id.as_ref());
    let (Some(content), Some(agent_id)) = (content, agent_id) else {
        return Err(RelayError::InvalidRequest(
            "Content and agentId are required".to_string(),
        ));
    };

    require_owned_thread(state, user_id, thread_id).await?;
    let agent = state.active_agent(agent_id)?;

    state
        .store
        .insert_turn(thread_id, Role::User, &content)
        .await?;
    let history = state
        .store
        .recent_turns(thread_id, state.config.relay.history_window)
        .await?;

    let request = build_completion_request(&agent, &content, &history, stream);
    Ok(PreparedSend {
        user_id,
        agent,
        request,
    })
}

/// `POST /api/chat/threads/{threadId}/messages`
pub async fn send_handler(
    State(state): State<Arc<AppState>>,
    headers: &http::HeaderMap,
    thread_id: ThreadId,
    body: Bytes,
) -> Response {
    send_inner(&state, headers, thread_id, &body)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn send_inner(
    state: &AppState,
    headers: &http::HeaderMap,
    thread_id: ThreadId,
    body: &[u8],
) -> Result<Response, RelayError> {
    let prepared = prepare_send(state, headers, thread_id, body, false).await?;
    let fallbacks = &state.config.fallback_messages;
    let ctx = FallbackContext {
        model: &prepared.agent.model,
        base_url: state.upstream.base_url(),
    };

    let content = match state.upstream.complete(&prepared.request).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => fallbacks.empty_response.clone(),
        Err(failure) => {
            tracing::warn!(
                thread_id,
                kind = failure.kind(),
                error = %failure,
                "upstream completion failed"
            );
            failure.render(fallbacks, ctx)
        }
    };

    let turn_id = state
        .store
        .insert_turn(thread_id, Role::Assistant, &content)
        .await?;
    if let Err(err) = state.store.touch_thread(thread_id).await {
        tracing::warn!(thread_id, error = %err, "failed to update thread timestamp");
    }

    tracing::info!(
        user_id = prepared.user_id,
        thread_id,
        turn_id,
        chars = content.len(),
        "assistant reply stored"
    );
    Ok(Json(json!({
        "message": {
            "id": turn_id,
            "role": Role::Assistant,
            "content": content,
            "created_at": Utc::now(),
        }
    }))
    .into_response())
}

/// `POST /api/chat/threads/{threadId}/messages/stream`
///
/// Validation and the user-turn write happen before the response starts, so
/// those failures still get a JSON error. Everything after is streamed.
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    headers: &http::HeaderMap,
    thread_id: ThreadId,
    body: Bytes,
) -> Response {
    let prepared = match prepare_send(&state, headers, thread_id, &body, true).await {
        Ok(prepared) => prepared,
        Err(err) => return err.into_response(),
    };

    let session = StreamSession::new(state.next_session_id(), thread_id);
    let settings = state.relay_settings(&prepared.agent);
    let (emitter, rx) = DownstreamEmitter::channel(state.config.relay.channel_capacity);
    let upstream = state.upstream.clone();
    let store = Arc::clone(&state.store);
    let request = prepared.request;

    tracing::info!(
        session_id = %session.id(),
        user_id = prepared.user_id,
        thread_id,
        agent_id = prepared.agent.id,
        model = %request.model,
        history = request.messages.len().saturating_sub(1),
        "stream session opened"
    );

    tokio::spawn(async move {
        let open = upstream.open_stream(&request);
        let report = drive_session(session, open, emitter, store, &settings).await;
        log_session_complete(&report);
    });

    sse_response(rx)
}
