//! Stand-in for the completion gateway, for running chat-relay by hand.
//!
//! `MOCK_SCENARIO` picks the behaviour of `POST /api/chat/completions`:
//! `text` (default), `empty`, `broken`, `unauthorized`, `missing_model`,
//! `detail`. `MOCK_DELAY_MS` spaces out streamed chunks.

use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_GATEWAY_PORT: u16 = 8080;
const REPLY_WORDS: &[&str] = &["Peace ", "be ", "with ", "you. ", "How ", "can ", "I ", "help?"];

type MockBody = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Copy, Clone, Debug)]
enum MockScenario {
    Text,
    Empty,
    Broken,
    Unauthorized,
    MissingModel,
    Detail,
}

struct MockState {
    scenario: MockScenario,
    delay: Duration,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("GATEWAY_PORT", DEFAULT_GATEWAY_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        delay: Duration::from_millis(env_u64("MOCK_DELAY_MS", 40)),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock gateway on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock gateway on 127.0.0.1:{port} (scenario={:?}, delay={:?})",
        state.scenario, state.delay
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock gateway connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("empty") => MockScenario::Empty,
        Ok("broken") => MockScenario::Broken,
        Ok("unauthorized") => MockScenario::Unauthorized,
        Ok("missing_model") => MockScenario::MissingModel,
        Ok("detail") => MockScenario::Detail,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &Arc<MockState>) -> Response<MockBody> {
    let (parts, body) = request.into_parts();
    let body = body
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    if parts.method == Method::GET && parts.uri.path() == "/_mock/stats" {
        let count = state.requests.load(Ordering::Relaxed);
        return json_response(StatusCode::OK, format!("{{\"requests\":{count}}}"));
    }
    if parts.method != Method::POST {
        return json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            r#"{"detail":"method not allowed"}"#.to_string(),
        );
    }
    if parts.uri.path() != "/api/chat/completions" {
        return json_response(StatusCode::NOT_FOUND, r#"{"detail":"not found"}"#.to_string());
    }
    state.requests.fetch_add(1, Ordering::Relaxed);

    let request: serde_json::Value = serde_json::from_slice(&body).unwrap_or_default();
    let model = request["model"].as_str().unwrap_or("unknown").to_string();
    let is_stream = request["stream"].as_bool().unwrap_or(false);

    match state.scenario {
        MockScenario::Unauthorized => json_response(
            StatusCode::UNAUTHORIZED,
            r#"{"detail":"Invalid API key"}"#.to_string(),
        ),
        MockScenario::MissingModel => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "detail": format!("model '{model}' not found") }).to_string(),
        ),
        MockScenario::Detail => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"detail":"model is still loading"}"#.to_string(),
        ),
        MockScenario::Text | MockScenario::Empty | MockScenario::Broken if !is_stream => {
            let content = match state.scenario {
                MockScenario::Empty => String::new(),
                _ => REPLY_WORDS.concat(),
            };
            json_response(
                StatusCode::OK,
                serde_json::json!({
                    "id": "chatcmpl-mock",
                    "object": "chat.completion",
                    "model": model,
                    "choices": [{
                        "index": 0,
                        "message": { "role": "assistant", "content": content },
                        "finish_reason": "stop"
                    }]
                })
                .to_string(),
            )
        }
        scenario => streaming_response(scenario, &model, state.delay),
    }
}

fn chunk_frame(model: &str, content: &str) -> Bytes {
    let chunk = serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{ "index": 0, "delta": { "content": content }, "finish_reason": null }]
    });
    Bytes::from(format!("data: {chunk}\n\n"))
}

fn streaming_response(scenario: MockScenario, model: &str, delay: Duration) -> Response<MockBody> {
    let mut frames: Vec<Bytes> = Vec::new();
    match scenario {
        MockScenario::Empty => {}
        MockScenario::Broken => {
            frames.extend(REPLY_WORDS.iter().take(3).map(|word| chunk_frame(model, word)));
        }
        _ => {
            frames.push(Bytes::from_static(b": keep-alive\n\n"));
            frames.extend(REPLY_WORDS.iter().map(|word| chunk_frame(model, word)));
        }
    }
    if !matches!(scenario, MockScenario::Broken) {
        frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
    }

    let stream = futures_util::stream::iter(frames).then(move |frame| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, Infallible>(Frame::data(frame))
    });
    let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn json_response(status: StatusCode, body: String) -> Response<MockBody> {
    let mut response = Response::new(Full::new(Bytes::from(body)).boxed_unsync());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
