use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::{ServerConfig, UpstreamConfig};
use crate::error::RelayError;

use super::fallback::UpstreamFailure;

const COMPLETIONS_PATH: &str = "/api/chat/completions";
// Enough of an error body to find a `detail` field without buffering a page.
const ERROR_BODY_LIMIT: usize = 16 * 1024;

fn build_reqwest_client(
    pool_max_idle_per_host: usize,
    pool_idle_timeout: Option<Duration>,
    use_env_proxy: bool,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, RelayError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| RelayError::Internal(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| RelayError::Internal(format!("Failed to build HTTP client: {err}")))
}

/// One message in the upstream `messages` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Body of `POST {base}/api/chat/completions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

#[derive(Deserialize)]
struct CompletionWire {
    #[serde(default)]
    choices: Vec<CompletionChoiceWire>,
}

#[derive(Deserialize)]
struct CompletionChoiceWire {
    #[serde(default)]
    message: Option<CompletionMessageWire>,
}

#[derive(Deserialize)]
struct CompletionMessageWire {
    #[serde(default)]
    content: Option<String>,
}

/// Client for the OpenAI-compatible completions gateway.
///
/// A single attempt is made per call. Cloning shares the connection pool.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    completions_url: String,
    api_key: Option<String>,
    first_byte_timeout: Duration,
    stream_timeout: Duration,
}

impl UpstreamClient {
    /// Build a client with pooling settings from `server` and endpoint settings from `upstream`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Internal`] if the proxy URL is invalid or the client cannot be built.
    pub fn new(server: &ServerConfig, upstream: &UpstreamConfig) -> Result<Self, RelayError> {
        let pool_idle_timeout = if server.http_pool_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(server.http_pool_idle_timeout_secs))
        };
        let client = build_reqwest_client(
            server.http_pool_max_idle_per_host.max(1),
            pool_idle_timeout,
            upstream.use_env_proxy,
            upstream.proxy.as_deref().map(str::trim),
        )?;
        let base_url = upstream.base_url.trim_end_matches('/').to_string();
        let api_key = upstream
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        Ok(Self {
            client,
            completions_url: format!("{base_url}{COMPLETIONS_PATH}"),
            base_url,
            api_key,
            first_byte_timeout: Duration::from_secs(upstream.first_byte_timeout_secs),
            stream_timeout: Duration::from_secs(upstream.stream_timeout_secs),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn completions_url(&self) -> &str {
        &self.completions_url
    }

    #[must_use]
    pub fn stream_timeout(&self) -> Duration {
        self.stream_timeout
    }

    fn request(&self, body: &CompletionRequest) -> reqwest::RequestBuilder {
        let accept = if body.stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let builder = self
            .client
            .post(&self.completions_url)
            .header(http::header::ACCEPT, accept)
            .json(body);
        match self.api_key.as_deref() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send the request and wait for response headers, bounded by the first-byte timeout.
    async fn send(&self, body: &CompletionRequest) -> Result<reqwest::Response, UpstreamFailure> {
        let response = tokio::time::timeout(self.first_byte_timeout, self.request(body).send())
            .await
            .map_err(|_| UpstreamFailure::TimedOut(self.first_byte_timeout))?
            .map_err(|err| UpstreamFailure::from_reqwest(&err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = read_error_body(response).await;
        Err(UpstreamFailure::from_status(status, &body))
    }

    /// Open a streamed completion. The returned stream yields raw SSE bytes.
    ///
    /// Only headers are bounded here; the caller owns the total stream deadline.
    ///
    /// # Errors
    ///
    /// Returns the classified [`UpstreamFailure`] for timeouts, transport errors
    /// and non-2xx responses.
    pub async fn open_stream(
        &self,
        body: &CompletionRequest,
    ) -> Result<impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static, UpstreamFailure>
    {
        let response = self.send(body).await?;
        tracing::debug!(
            status = response.status().as_u16(),
            model = %body.model,
            "upstream stream opened"
        );
        Ok(response.bytes_stream())
    }

    /// Run a non-streamed completion and return `choices[0].message.content`.
    ///
    /// An empty string means the gateway answered without content.
    ///
    /// # Errors
    ///
    /// Returns the classified [`UpstreamFailure`]; the whole exchange is bounded
    /// by the stream timeout.
    pub async fn complete(&self, body: &CompletionRequest) -> Result<String, UpstreamFailure> {
        let exchange = async {
            let response = self.send(body).await?;
            let wire: CompletionWire = response.json().await.map_err(|err| {
                if err.is_decode() {
                    UpstreamFailure::Transport(format!("invalid completion body: {err}"))
                } else {
                    UpstreamFailure::from_reqwest(&err)
                }
            })?;
            Ok(wire
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message)
                .and_then(|message| message.content)
                .unwrap_or_default())
        };
        tokio::time::timeout(self.stream_timeout, exchange)
            .await
            .map_err(|_| UpstreamFailure::TimedOut(self.stream_timeout))?
    }
}

async fn read_error_body(response: reqwest::Response) -> Vec<u8> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        let room = ERROR_BODY_LIMIT.saturating_sub(body.len());
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if body.len() >= ERROR_BODY_LIMIT {
            break;
        }
    }
    body
}
