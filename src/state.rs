mod request_id;

use std::fmt;
use std::sync::Arc;

use crate::agents::AgentDirectory;
use crate::auth::ClientIdentities;
use crate::config::{AgentConfig, AppConfig};
use crate::error::RelayError;
use crate::relay::RelaySettings;
use crate::store::{ChatStore, UserId};
use crate::transport::UpstreamClient;

use request_id::RequestIdGenerator;

/// Whether the service has what it needs to serve chat routes.
///
/// Decided once at startup and carried in [`AppState`]; chat routes answer
/// 503 while not installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallationStatus {
    Installed,
    NotInstalled { reason: String },
}

impl InstallationStatus {
    #[must_use]
    pub fn evaluate(
        agents: &AgentDirectory,
        identities: &ClientIdentities,
        store_error: Option<&str>,
    ) -> Self {
        if let Some(err) = store_error {
            return InstallationStatus::NotInstalled {
                reason: format!("storage is unavailable: {err}"),
            };
        }
        if agents.is_empty() {
            return InstallationStatus::NotInstalled {
                reason: "no active agents are configured".to_string(),
            };
        }
        if identities.is_empty() {
            return InstallationStatus::NotInstalled {
                reason: "no client identities are configured".to_string(),
            };
        }
        InstallationStatus::Installed
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        matches!(self, InstallationStatus::Installed)
    }
}

impl fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallationStatus::Installed => f.write_str("installed"),
            InstallationStatus::NotInstalled { reason } => write!(f, "not installed ({reason})"),
        }
    }
}

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamClient,
    pub store: Arc<dyn ChatStore>,
    pub agents: AgentDirectory,
    identities: ClientIdentities,
    installation: InstallationStatus,
    request_ids: RequestIdGenerator,
}

impl AppState {
    /// Build state from a loaded config and an opened store.
    ///
    /// `store_error` is the reason the configured store could not be opened,
    /// in which case `store` is a stand-in and chat routes stay disabled.
    #[must_use]
    pub fn new(
        config: AppConfig,
        upstream: UpstreamClient,
        store: Arc<dyn ChatStore>,
        store_error: Option<&str>,
    ) -> Self {
        let agents = AgentDirectory::from_config(&config);
        let identities = ClientIdentities::from_config(&config);
        let installation = InstallationStatus::evaluate(&agents, &identities, store_error);
        Self {
            config,
            upstream,
            store,
            agents,
            identities,
            installation,
            request_ids: RequestIdGenerator::new(),
        }
    }

    #[must_use]
    pub fn installation(&self) -> &InstallationStatus {
        &self.installation
    }

    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    /// Resolve the calling user.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Auth` when the bearer token is missing or unknown.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<UserId, RelayError> {
        self.identities.authenticate(headers)
    }

    /// Look up an active agent.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::NotFound` for unknown or inactive agents.
    pub fn active_agent(&self, agent_id: i64) -> Result<Arc<AgentConfig>, RelayError> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| RelayError::NotFound("Agent not found or inactive".to_string()))
    }

    #[must_use]
    pub fn next_session_id(&self) -> String {
        self.request_ids.session_id()
    }

    #[must_use]
    pub fn relay_settings(&self, agent: &AgentConfig) -> RelaySettings {
        RelaySettings {
            stream_timeout: self.upstream.stream_timeout(),
            model: agent.model.clone(),
            base_url: self.upstream.base_url().to_string(),
            fallbacks: self.config.fallback_messages.clone(),
        }
    }
}
