use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use chat_relay::config::{
    parse_config, AppConfig, ClientIdentityConfig, StorageBackend,
};
use chat_relay::routing::dispatch::dispatch_request;
use chat_relay::state::AppState;
use chat_relay::store::{ChatStore, MemoryStore, Role};
use chat_relay::transport::UpstreamClient;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};

const ALICE: &str = "alice-key";
const BOB: &str = "bob-key";
const GREETER_AGENT: i64 = 1;
const PLAIN_AGENT: i64 = 2;

fn test_config(base_url: String, first_byte_secs: u64, stream_secs: u64) -> AppConfig {
    let mut config = parse_config(
        r#"
agents:
  - id: 1
    name: Sage
    model: llama3
    prompt_template: "You are {agent_name}."
    greeting: "Peace be with you."
  - id: 2
    name: Helper
    model: mistral
    prompt_template: "You are {agent_name}. Question: {user_message}"
    response_style: casual
"#,
    )
    .expect("parse test config");
    config.upstream.base_url = base_url;
    config.upstream.first_byte_timeout_secs = first_byte_secs;
    config.upstream.stream_timeout_secs = stream_secs;
    config.storage.backend = StorageBackend::Memory;
    config.client_authentication.users = vec![
        ClientIdentityConfig {
            key: ALICE.to_string(),
            user_id: 1,
        },
        ClientIdentityConfig {
            key: BOB.to_string(),
            user_id: 2,
        },
    ];
    config
}

fn build_state_with_timeouts(
    base_url: String,
    first_byte_secs: u64,
    stream_secs: u64,
) -> Arc<AppState> {
    let config = test_config(base_url, first_byte_secs, stream_secs);
    let upstream =
        UpstreamClient::new(&config.server, &config.upstream).expect("build upstream client");
    let state = AppState::new(config, upstream, Arc::new(MemoryStore::new()), None);
    assert!(state.installation().is_installed());
    Arc::new(state)
}

fn build_state(base_url: String) -> Arc<AppState> {
    build_state_with_timeouts(base_url, 30, 30)
}

async fn spawn_upstream(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), server)
}

/// Upstream that answers every completion with `frames`, pausing `delay` before each.
fn streaming_upstream(frames: Vec<&'static str>, delay: Duration) -> Router {
    Router::new().route(
        "/api/chat/completions",
        post(move || {
            let frames = frames.clone();
            async move { sse_body(frames, delay) }
        }),
    )
}

fn sse_body(frames: Vec<&'static str>, delay: Duration) -> Response {
    let stream = futures_util::stream::iter(frames).then(move |frame| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Infallible>(Bytes::from_static(frame.as_bytes()))
    });
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .expect("build sse response")
}

fn chunk(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "index": 0, "delta": { "content": content } }] })
    )
}

fn leak(frame: String) -> &'static str {
    Box::leak(frame.into_boxed_str())
}

async fn dispatch(state: &Arc<AppState>, request: Request<Body>) -> Response {
    dispatch_request(Arc::clone(state), Arc::<str>::from(""), request)
        .await
        .expect("dispatch")
}

fn json_request(method: &str, uri: &str, key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).expect("serialize body")))
        .expect("build request")
}

async fn read_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&body).expect("json payload")
}

fn parse_frames(body: &[u8]) -> Vec<Value> {
    let text = std::str::from_utf8(body).expect("utf8 body");
    text.split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| {
            let data = frame.strip_prefix("data: ").expect("data frame");
            serde_json::from_str(data).expect("frame json")
        })
        .collect()
}

async fn create_thread(state: &Arc<AppState>, key: &str, agent_id: i64) -> i64 {
    let response = dispatch(
        state,
        json_request(
            "POST",
            "/api/chat/threads",
            Some(key),
            json!({ "title": "Test thread", "agentId": agent_id }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["message"], "Thread created successfully");
    payload["threadId"].as_i64().expect("thread id")
}

async fn stream_message(state: &Arc<AppState>, thread_id: i64, content: &str) -> Vec<Value> {
    let response = dispatch(
        state,
        json_request(
            "POST",
            &format!("/api/chat/threads/{thread_id}/messages/stream"),
            Some(ALICE),
            json!({ "content": content, "agentId": PLAIN_AGENT }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read stream body");
    parse_frames(&body)
}

async fn assistant_turns(state: &Arc<AppState>, thread_id: i64) -> Vec<String> {
    state
        .store
        .list_turns(thread_id)
        .await
        .expect("list turns")
        .into_iter()
        .filter(|turn| turn.role == Role::Assistant)
        .map(|turn| turn.content)
        .collect()
}

fn contents(frames: &[Value]) -> Vec<&str> {
    frames
        .iter()
        .filter_map(|frame| frame["content"].as_str())
        .collect()
}

#[tokio::test]
async fn test_stream_relays_fragments_in_order_then_done() {
    let frames = vec![
        leak(chunk("Hel")),
        leak(chunk("lo")),
        leak(chunk(", world")),
        "data: [DONE]\n\n",
    ];
    let (base_url, server) = spawn_upstream(streaming_upstream(frames, Duration::ZERO)).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "Say hello").await;
    assert_eq!(contents(&frames), vec!["Hel", "lo", ", world"]);

    let last = frames.last().expect("done frame");
    assert_eq!(last["done"], true);
    let stored = state.store.list_turns(thread_id).await.expect("list turns");
    let assistant = stored
        .iter()
        .find(|turn| turn.role == Role::Assistant)
        .expect("assistant turn");
    assert_eq!(assistant.content, "Hello, world");
    assert_eq!(last["messageId"].as_i64(), Some(assistant.id));

    // The user turn is written before the reply.
    assert_eq!(stored[0].role, Role::User);
    assert_eq!(stored[0].content, "Say hello");

    server.abort();
}

#[tokio::test]
async fn test_stream_persists_exactly_one_assistant_turn() {
    let frames = vec![leak(chunk("only once")), "data: [DONE]\n\n"];
    let (base_url, server) = spawn_upstream(streaming_upstream(frames, Duration::ZERO)).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "hi").await;
    assert_eq!(frames.iter().filter(|frame| frame["done"] == true).count(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(assistant_turns(&state, thread_id).await, vec!["only once"]);

    server.abort();
}

#[tokio::test]
async fn test_stream_skips_malformed_events() {
    let frames = vec![
        leak(chunk("A")),
        "data: {not json\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        leak(chunk("B")),
        "data: [DONE]\n\n",
    ];
    let (base_url, server) = spawn_upstream(streaming_upstream(frames, Duration::ZERO)).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "hi").await;
    assert_eq!(contents(&frames), vec!["A", "B"]);
    assert_eq!(assistant_turns(&state, thread_id).await, vec!["AB"]);

    server.abort();
}

#[tokio::test]
async fn test_stream_without_done_marker_keeps_text() {
    let frames = vec![leak(chunk("cut ")), leak(chunk("short"))];
    let (base_url, server) = spawn_upstream(streaming_upstream(frames, Duration::ZERO)).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "hi").await;
    assert_eq!(contents(&frames), vec!["cut ", "short"]);
    assert_eq!(frames.last().expect("done")["done"], true);
    assert_eq!(assistant_turns(&state, thread_id).await, vec!["cut short"]);

    server.abort();
}

#[tokio::test]
async fn test_stream_connection_refused_persists_fallback() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let base_url = format!("http://{addr}");
    let state = build_state(base_url.clone());
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "anyone there?").await;
    assert_eq!(frames.len(), 2);
    let text = frames[0]["content"].as_str().expect("fallback content");
    assert!(text.contains("cannot connect"), "unexpected fallback: {text}");
    assert!(text.contains(&base_url), "fallback should name the gateway: {text}");
    assert_eq!(frames[1]["done"], true);

    assert_eq!(assistant_turns(&state, thread_id).await, vec![text.to_string()]);
}

#[tokio::test]
async fn test_stream_unauthorized_upstream_uses_auth_fallback() {
    let app = Router::new().route(
        "/api/chat/completions",
        post(|| async {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "bad key" })),
            )
                .into_response()
        }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "hi").await;
    let expected = state.config.fallback_messages.authentication_failed.clone();
    assert_eq!(contents(&frames), vec![expected.as_str()]);
    assert_eq!(frames.last().expect("done")["done"], true);
    assert_eq!(assistant_turns(&state, thread_id).await, vec![expected]);

    server.abort();
}

#[tokio::test]
async fn test_stream_missing_model_uses_model_fallback() {
    let app = Router::new().route(
        "/api/chat/completions",
        post(|| async { StatusCode::NOT_FOUND.into_response() }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "hi").await;
    let text = frames[0]["content"].as_str().expect("fallback content");
    assert!(text.contains("\"mistral\""), "unexpected fallback: {text}");

    server.abort();
}

#[tokio::test]
async fn test_stream_upstream_detail_is_surfaced() {
    let app = Router::new().route(
        "/api/chat/completions",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "model is still loading" })),
            )
                .into_response()
        }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "hi").await;
    assert_eq!(
        contents(&frames),
        vec!["AI service error: model is still loading"]
    );

    server.abort();
}

#[tokio::test]
async fn test_stream_empty_completion_uses_empty_response_text() {
    let frames = vec!["data: [DONE]\n\n"];
    let (base_url, server) = spawn_upstream(streaming_upstream(frames, Duration::ZERO)).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let frames = stream_message(&state, thread_id, "hi").await;
    let expected = state.config.fallback_messages.empty_response.clone();
    assert_eq!(contents(&frames), vec![expected.as_str()]);
    assert_eq!(assistant_turns(&state, thread_id).await, vec![expected]);

    server.abort();
}

#[tokio::test]
async fn test_stream_timeout_keeps_partial_text() {
    let frames = vec![leak(chunk("slow")), leak(chunk(" never"))];
    let app = Router::new().route(
        "/api/chat/completions",
        post(move || {
            let frames = frames.clone();
            async move {
                let stream = futures_util::stream::iter(frames.into_iter().enumerate()).then(
                    |(index, frame)| async move {
                        if index > 0 {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                        Ok::<_, Infallible>(Bytes::from_static(frame.as_bytes()))
                    },
                );
                Response::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::from_stream(stream))
                    .expect("build sse response")
            }
        }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let state = build_state_with_timeouts(base_url, 1, 1);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let started = std::time::Instant::now();
    let frames = stream_message(&state, thread_id, "hi").await;
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(contents(&frames), vec!["slow"]);
    assert_eq!(frames.last().expect("done")["done"], true);
    assert_eq!(assistant_turns(&state, thread_id).await, vec!["slow"]);

    server.abort();
}

#[tokio::test]
async fn test_slow_response_headers_hit_first_byte_timeout() {
    let app = Router::new().route(
        "/api/chat/completions",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            sse_body(vec!["data: [DONE]\n\n"], Duration::ZERO)
        }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let state = build_state_with_timeouts(base_url, 1, 30);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let started = std::time::Instant::now();
    let frames = stream_message(&state, thread_id, "hi").await;
    assert!(started.elapsed() < Duration::from_secs(3));

    let turns = assistant_turns(&state, thread_id).await;
    assert_eq!(turns.len(), 1);
    assert!(turns[0].ends_with("Error: timeout of 1000ms exceeded"));
    assert_eq!(contents(&frames), vec![turns[0].as_str()]);
    assert_eq!(frames.last().expect("done")["done"], true);

    server.abort();
}

#[tokio::test]
async fn test_client_disconnect_still_persists_once() {
    let frames = vec![
        leak(chunk("Hel")),
        leak(chunk("lo")),
        leak(chunk(" there")),
        "data: [DONE]\n\n",
    ];
    let (base_url, server) =
        spawn_upstream(streaming_upstream(frames, Duration::from_millis(150))).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let response = dispatch(
        &state,
        json_request(
            "POST",
            &format!("/api/chat/threads/{thread_id}/messages/stream"),
            Some(ALICE),
            json!({ "content": "hi", "agentId": PLAIN_AGENT }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = body
        .next()
        .await
        .expect("first frame")
        .expect("frame bytes");
    assert_eq!(parse_frames(&first)[0]["content"], "Hel");
    drop(body);

    let mut persisted = Vec::new();
    for _ in 0..100 {
        persisted = assistant_turns(&state, thread_id).await;
        if !persisted.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(persisted.len(), 1);
    assert!(persisted[0].starts_with("Hel"), "partial text: {}", persisted[0]);
    assert_ne!(persisted[0], "Hello there");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(assistant_turns(&state, thread_id).await.len(), 1);

    server.abort();
}

#[tokio::test]
async fn test_upstream_request_carries_prompt_and_history() {
    let captured: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&captured);
    let app = Router::new().route(
        "/api/chat/completions",
        post(move |Json(body): Json<Value>| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock() = Some(body);
                sse_body(vec!["data: [DONE]\n\n"], Duration::ZERO)
            }
        }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let _ = stream_message(&state, thread_id, "What is rust?").await;

    let body = captured.lock().clone().expect("captured upstream body");
    assert_eq!(body["model"], "mistral");
    assert_eq!(body["stream"], true);
    let messages = body["messages"].as_array().expect("messages");
    assert_eq!(messages[0]["role"], "system");
    let system = messages[0]["content"].as_str().expect("system prompt");
    assert!(system.starts_with("You are Helper. Question: What is rust?"));
    assert!(system.ends_with("Respond in a casual, friendly manner."));
    let last = messages.last().expect("user turn");
    assert_eq!(last["role"], "user");
    assert_eq!(last["content"], "What is rust?");

    server.abort();
}

#[tokio::test]
async fn test_non_stream_send_returns_stored_reply() {
    let app = Router::new().route(
        "/api/chat/completions",
        post(|| async {
            Json(json!({
                "choices": [
                    { "index": 0, "message": { "role": "assistant", "content": "pong" } }
                ]
            }))
        }),
    );
    let (base_url, server) = spawn_upstream(app).await;
    let state = build_state(base_url);
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let response = dispatch(
        &state,
        json_request(
            "POST",
            &format!("/api/chat/threads/{thread_id}/messages"),
            Some(ALICE),
            json!({ "content": "ping", "agentId": PLAIN_AGENT }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["message"]["role"], "assistant");
    assert_eq!(payload["message"]["content"], "pong");
    assert_eq!(assistant_turns(&state, thread_id).await, vec!["pong"]);

    server.abort();
}

#[tokio::test]
async fn test_thread_create_list_and_messages() {
    let state = build_state("http://127.0.0.1:9".to_string());
    let thread_id = create_thread(&state, ALICE, GREETER_AGENT).await;

    let response = dispatch(
        &state,
        json_request("GET", "/api/chat/threads", Some(ALICE), Value::Null),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    let threads = payload["threads"].as_array().expect("threads");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0]["id"].as_i64(), Some(thread_id));
    assert_eq!(threads[0]["title"], "Test thread");
    assert_eq!(threads[0]["message_count"], 1);

    let response = dispatch(
        &state,
        json_request(
            "GET",
            &format!("/api/chat/threads/{thread_id}/messages"),
            Some(ALICE),
            Value::Null,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    let messages = payload["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["role"], "assistant");
    assert_eq!(messages[0]["content"], "Peace be with you.");

    // Bob sees none of it.
    let response = dispatch(
        &state,
        json_request("GET", "/api/chat/threads", Some(BOB), Value::Null),
    )
    .await;
    let payload = read_json(response).await;
    assert!(payload["threads"].as_array().expect("threads").is_empty());
}

#[tokio::test]
async fn test_delete_thread_is_owner_only() {
    let state = build_state("http://127.0.0.1:9".to_string());
    let thread_id = create_thread(&state, ALICE, GREETER_AGENT).await;
    let uri = format!("/api/chat/threads/{thread_id}");

    let response = dispatch(&state, json_request("DELETE", &uri, Some(BOB), Value::Null)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(response).await["message"], "Thread not found");
    assert!(state.store.get_thread(thread_id).await.expect("get").is_some());

    let response = dispatch(&state, json_request("DELETE", &uri, Some(ALICE), Value::Null)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_json(response).await["message"], "Thread deleted successfully");
    assert!(state.store.get_thread(thread_id).await.expect("get").is_none());
    assert!(state
        .store
        .list_turns(thread_id)
        .await
        .expect("list turns")
        .is_empty());

    let response = dispatch(&state, json_request("DELETE", &uri, Some(ALICE), Value::Null)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_foreign_thread_is_not_found() {
    let state = build_state("http://127.0.0.1:9".to_string());
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let response = dispatch(
        &state,
        json_request(
            "POST",
            &format!("/api/chat/threads/{thread_id}/messages/stream"),
            Some(BOB),
            json!({ "content": "hi", "agentId": PLAIN_AGENT }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = read_json(response).await;
    assert_eq!(payload["message"], "Thread not found");
    assert!(state
        .store
        .list_turns(thread_id)
        .await
        .expect("list turns")
        .is_empty());
}

#[tokio::test]
async fn test_missing_content_is_bad_request() {
    let state = build_state("http://127.0.0.1:9".to_string());
    let thread_id = create_thread(&state, ALICE, PLAIN_AGENT).await;

    let response = dispatch(
        &state,
        json_request(
            "POST",
            &format!("/api/chat/threads/{thread_id}/messages/stream"),
            Some(ALICE),
            json!({ "agentId": PLAIN_AGENT }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = read_json(response).await;
    assert_eq!(payload["message"], "Content and agentId are required");
}

#[tokio::test]
async fn test_inactive_or_unknown_agent_is_not_found() {
    let state = build_state("http://127.0.0.1:9".to_string());
    let response = dispatch(
        &state,
        json_request(
            "POST",
            "/api/chat/threads",
            Some(ALICE),
            json!({ "agentId": 42 }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = read_json(response).await;
    assert_eq!(payload["message"], "Agent not found or inactive");
}
