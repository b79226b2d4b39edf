use serde_json::json;

use crate::store::StoreError;

/// Error type surfaced by HTTP handlers.
///
/// Upstream failures are not represented here: they are turned into fallback
/// assistant text (see [`crate::transport::UpstreamFailure`]).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Installation required: {0}")]
    NotInstalled(String),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    NotFound,
    Unavailable,
    ServerError,
}

impl RelayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            RelayError::Auth(_) => ErrorCategory::Authentication,
            RelayError::NotFound(_) => ErrorCategory::NotFound,
            RelayError::NotInstalled(_) => ErrorCategory::Unavailable,
            RelayError::Store(_) | RelayError::Internal(_) => ErrorCategory::ServerError,
        }
    }

    /// Message shown to clients. Storage details stay in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            RelayError::Store(_) | RelayError::Internal(_) => {
                "Failed to process chat request".to_string()
            }
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Category -> HTTP status code
// ---------------------------------------------------------------------------

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::Authentication => http::StatusCode::UNAUTHORIZED,
        ErrorCategory::NotFound => http::StatusCode::NOT_FOUND,
        ErrorCategory::Unavailable => http::StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Format an error as (`status_code`, JSON body).
#[must_use]
pub fn format_error(err: &RelayError) -> (http::StatusCode, serde_json::Value) {
    let status = http_status_for_category(err.category());
    (status, json!({ "message": err.public_message() }))
}

// ---------------------------------------------------------------------------
// Axum integration
// ---------------------------------------------------------------------------

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        if matches!(self.category(), ErrorCategory::ServerError) {
            tracing::error!(error = %self, "request failed");
        }
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
