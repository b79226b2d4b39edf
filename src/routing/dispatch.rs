use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{self, Body};
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::api::{health, messages, threads};
use crate::error::RelayError;
use crate::state::{AppState, InstallationStatus};
use crate::store::ThreadId;

const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;
const CHAT_PREFIX: &str = "/api/chat";

#[derive(Debug, PartialEq, Eq)]
enum RouteMatch {
    Health,
    ListThreads,
    CreateThread,
    DeleteThread { thread_id: ThreadId },
    ListMessages { thread_id: ThreadId },
    SendMessage { thread_id: ThreadId },
    StreamMessage { thread_id: ThreadId },
    MethodNotAllowed,
    NotFound,
}

impl RouteMatch {
    fn is_chat(&self) -> bool {
        !matches!(
            self,
            RouteMatch::Health | RouteMatch::MethodNotAllowed | RouteMatch::NotFound
        )
    }
}

/// Dispatch a raw HTTP request to the matching handler.
///
/// # Errors
///
/// This function currently never returns `Err` and uses `Infallible`.
pub async fn dispatch_request(
    state: Arc<AppState>,
    base_path: Arc<str>,
    request: Request<Body>,
) -> Result<Response, Infallible> {
    let (parts, body) = request.into_parts();
    let route = match_route(&parts.method, parts.uri.path(), base_path.as_ref());

    if route.is_chat() {
        if let InstallationStatus::NotInstalled { reason } = state.installation() {
            return Ok(RelayError::NotInstalled(reason.clone()).into_response());
        }
    }

    let response = match route {
        RouteMatch::Health => health::health_handler(State(state)).into_response(),
        RouteMatch::ListThreads => threads::list_threads(State(state), &parts.headers).await,
        RouteMatch::CreateThread => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            threads::create_thread(State(state), &parts.headers, body_bytes).await
        }
        RouteMatch::DeleteThread { thread_id } => {
            threads::delete_thread(State(state), &parts.headers, thread_id).await
        }
        RouteMatch::ListMessages { thread_id } => {
            threads::list_messages(State(state), &parts.headers, thread_id).await
        }
        RouteMatch::SendMessage { thread_id } => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            messages::send_handler(State(state), &parts.headers, thread_id, body_bytes).await
        }
        RouteMatch::StreamMessage { thread_id } => {
            let body_bytes = match read_request_body(body).await {
                Ok(bytes) => bytes,
                Err(response) => return Ok(response),
            };
            messages::stream_handler(State(state), &parts.headers, thread_id, body_bytes).await
        }
        RouteMatch::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        RouteMatch::NotFound => StatusCode::NOT_FOUND.into_response(),
    };

    Ok(response)
}

#[must_use]
pub fn normalize_base_path(base_path: &str) -> String {
    let trimmed = base_path.trim();
    if trimmed.is_empty() || trimmed == "/" {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("/{}", trimmed.trim_end_matches('/'))
    }
}

async fn read_request_body(body: Body) -> Result<bytes::Bytes, Response> {
    body::to_bytes(body, DEFAULT_BODY_LIMIT_BYTES)
        .await
        .map_err(|_| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "message": "Request body too large (max 2MiB)" })),
            )
                .into_response()
        })
}

fn only(method: &Method, expected: Method, route: RouteMatch) -> RouteMatch {
    if *method == expected {
        route
    } else {
        RouteMatch::MethodNotAllowed
    }
}

fn get_or_post(method: &Method, on_get: RouteMatch, on_post: RouteMatch) -> RouteMatch {
    if method == Method::GET {
        on_get
    } else if method == Method::POST {
        on_post
    } else {
        RouteMatch::MethodNotAllowed
    }
}

fn match_route(method: &Method, path: &str, base_path: &str) -> RouteMatch {
    let Some(path) = strip_base_path(path, base_path) else {
        return RouteMatch::NotFound;
    };

    if path == "/" {
        return only(method, Method::GET, RouteMatch::Health);
    }

    let Some(chat_path) = path.strip_prefix(CHAT_PREFIX) else {
        return RouteMatch::NotFound;
    };

    if chat_path == "/threads" {
        return get_or_post(method, RouteMatch::ListThreads, RouteMatch::CreateThread);
    }

    let Some(rest) = chat_path.strip_prefix("/threads/") else {
        return RouteMatch::NotFound;
    };
    let (raw_id, tail) = rest.split_once('/').unwrap_or((rest, ""));
    let Ok(thread_id) = raw_id.parse::<ThreadId>() else {
        return RouteMatch::NotFound;
    };

    match tail {
        "" => only(method, Method::DELETE, RouteMatch::DeleteThread { thread_id }),
        "messages" => get_or_post(
            method,
            RouteMatch::ListMessages { thread_id },
            RouteMatch::SendMessage { thread_id },
        ),
        "messages/stream" => only(method, Method::POST, RouteMatch::StreamMessage { thread_id }),
        _ => RouteMatch::NotFound,
    }
}

fn strip_base_path<'a>(path: &'a str, base_path: &str) -> Option<&'a str> {
    if base_path.is_empty() {
        return Some(path);
    }

    let remainder = path.strip_prefix(base_path)?;
    if remainder.is_empty() {
        Some("/")
    } else if remainder.starts_with('/') {
        Some(remainder)
    } else {
        None
    }
}
