use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::{AppState, InstallationStatus};

/// Health check handler.
/// Returns JSON with status, installation state and a config summary.
pub fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    let installation = match state.installation() {
        InstallationStatus::Installed => json!({ "installed": true }),
        InstallationStatus::NotInstalled { reason } => {
            json!({ "installed": false, "reason": reason })
        }
    };
    Json(json!({
        "status": "chat-relay is running",
        "installation": installation,
        "config": {
            "agents_count": state.agents.len(),
            "client_identities_count": state.identity_count(),
            "storage_backend": config.storage.backend.to_string(),
            "upstream_base_url": state.upstream.base_url(),
            "features": {
                "log_level": config.features.log_level,
            }
        }
    }))
}
