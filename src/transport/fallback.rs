use std::fmt;
use std::time::Duration;

use crate::config::FallbackMessages;

/// Why an upstream completion produced no usable text.
///
/// Never returned to clients as an error: it is rendered through
/// [`FallbackMessages`] and persisted as the assistant turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// HTTP 401 from the gateway.
    Unauthorized,
    /// HTTP 404 from the gateway.
    ModelNotFound,
    ConnectionRefused,
    /// Non-2xx response whose body carried a `detail` field.
    Detail { status: u16, detail: String },
    /// Non-2xx response with nothing more specific to say.
    Status(u16),
    TimedOut(Duration),
    Transport(String),
}

/// Values substituted into fallback templates.
#[derive(Debug, Clone, Copy)]
pub struct FallbackContext<'a> {
    pub model: &'a str,
    pub base_url: &'a str,
}

impl UpstreamFailure {
    /// Classify a non-2xx response from its status and (possibly partial) body.
    #[must_use]
    pub fn from_status(status: http::StatusCode, body: &[u8]) -> Self {
        match status.as_u16() {
            401 => UpstreamFailure::Unauthorized,
            404 => UpstreamFailure::ModelNotFound,
            code => match extract_detail(body) {
                Some(detail) => UpstreamFailure::Detail {
                    status: code,
                    detail,
                },
                None => UpstreamFailure::Status(code),
            },
        }
    }

    /// Classify a transport-level failure.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if is_connection_refused(err) {
            return UpstreamFailure::ConnectionRefused;
        }
        UpstreamFailure::Transport(error_chain_message(err))
    }

    /// Short label for logs and metrics fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamFailure::Unauthorized => "unauthorized",
            UpstreamFailure::ModelNotFound => "model_not_found",
            UpstreamFailure::ConnectionRefused => "connection_refused",
            UpstreamFailure::Detail { .. } => "upstream_detail",
            UpstreamFailure::Status(_) => "upstream_status",
            UpstreamFailure::TimedOut(_) => "timed_out",
            UpstreamFailure::Transport(_) => "transport",
        }
    }

    /// Render the user-facing text for this failure.
    #[must_use]
    pub fn render(&self, messages: &FallbackMessages, ctx: FallbackContext<'_>) -> String {
        match self {
            UpstreamFailure::Unauthorized => fill(&messages.authentication_failed, ctx, ""),
            UpstreamFailure::ModelNotFound => fill(&messages.model_not_found, ctx, ""),
            UpstreamFailure::ConnectionRefused => fill(&messages.connection_refused, ctx, ""),
            UpstreamFailure::Detail { detail, .. } => {
                fill(&messages.upstream_detail, ctx, "").replace("{detail}", detail)
            }
            other => fill(&messages.generic, ctx, &other.to_string()),
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamFailure::Unauthorized => write!(f, "Request failed with status code 401"),
            UpstreamFailure::ModelNotFound => write!(f, "Request failed with status code 404"),
            UpstreamFailure::ConnectionRefused => write!(f, "connection refused"),
            UpstreamFailure::Detail { status, detail } => {
                write!(f, "Request failed with status code {status}: {detail}")
            }
            UpstreamFailure::Status(status) => {
                write!(f, "Request failed with status code {status}")
            }
            UpstreamFailure::TimedOut(limit) => {
                write!(f, "timeout of {}ms exceeded", limit.as_millis())
            }
            UpstreamFailure::Transport(message) => f.write_str(message),
        }
    }
}

fn fill(template: &str, ctx: FallbackContext<'_>, error: &str) -> String {
    template
        .replace("{model}", ctx.model)
        .replace("{base_url}", ctx.base_url)
        .replace("{error}", error)
}

fn extract_detail(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    match value.get("detail")? {
        serde_json::Value::Null => None,
        serde_json::Value::String(detail) if detail.trim().is_empty() => None,
        serde_json::Value::String(detail) => Some(detail.clone()),
        other => Some(other.to_string()),
    }
}

fn is_connection_refused(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        if contains_ascii_case_insensitive(current.to_string().as_bytes(), b"connection refused") {
            return true;
        }
        source = current.source();
    }
    false
}

fn error_chain_message(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(current) = source {
        message.push_str(": ");
        message.push_str(&current.to_string());
        source = current.source();
    }
    message
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }

    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}
