pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;

use self::validation::validate_config;

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "CHAT_RELAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub base_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_max_blocking_threads: Option<usize>,
    pub http_pool_max_idle_per_host: usize,
    pub http_pool_idle_timeout_secs: u64,
}

fn default_port() -> u16 {
    3001
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize)]
struct ServerConfigWire {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default)]
    base_path: String,
    #[serde(default)]
    runtime_worker_threads: Option<RuntimeThreadsSetting>,
    #[serde(default)]
    runtime_max_blocking_threads: Option<RuntimeThreadsSetting>,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    http_pool_idle_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeThreadsSetting {
    Fixed(usize),
    Auto(()),
}

fn runtime_threads_or_default(
    setting: Option<&RuntimeThreadsSetting>,
    default: Option<usize>,
) -> Option<usize> {
    match setting {
        None => default,
        Some(RuntimeThreadsSetting::Fixed(threads)) => Some(*threads),
        Some(RuntimeThreadsSetting::Auto(())) => None,
    }
}

impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let wire = ServerConfigWire::deserialize(deserializer)?;
        Ok(Self {
            port: wire.port,
            host: wire.host,
            base_path: wire.base_path,
            // missing => default, explicit null => runtime decides
            runtime_worker_threads: runtime_threads_or_default(
                wire.runtime_worker_threads.as_ref(),
                None,
            ),
            runtime_max_blocking_threads: runtime_threads_or_default(
                wire.runtime_max_blocking_threads.as_ref(),
                Some(8),
            ),
            http_pool_max_idle_per_host: wire.http_pool_max_idle_per_host,
            http_pool_idle_timeout_secs: wire.http_pool_idle_timeout_secs,
        })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_path: String::new(),
            runtime_worker_threads: None,
            runtime_max_blocking_threads: Some(8),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
        }
    }
}

/// The OpenAI-compatible gateway completions are relayed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub use_env_proxy: bool,
    #[serde(default = "default_upstream_timeout_secs")]
    pub first_byte_timeout_secs: u64,
    #[serde(default = "default_upstream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

fn default_upstream_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_upstream_timeout_secs() -> u64 {
    30
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            api_key: None,
            proxy: None,
            use_env_proxy: false,
            first_byte_timeout_secs: default_upstream_timeout_secs(),
            stream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

/// Relay tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Number of most recent thread turns sent upstream after the system prompt.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Frames buffered between the session task and the client response body.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_history_window() -> usize {
    10
}
fn default_channel_capacity() -> usize {
    32
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// User-facing texts persisted as the assistant turn when upstream produced nothing.
///
/// Placeholders: `{model}`, `{base_url}`, `{detail}`, `{error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackMessages {
    #[serde(default = "default_authentication_failed")]
    pub authentication_failed: String,
    #[serde(default = "default_model_not_found")]
    pub model_not_found: String,
    #[serde(default = "default_connection_refused")]
    pub connection_refused: String,
    #[serde(default = "default_upstream_detail")]
    pub upstream_detail: String,
    #[serde(default = "default_generic")]
    pub generic: String,
    #[serde(default = "default_empty_response")]
    pub empty_response: String,
}

fn default_authentication_failed() -> String {
    "Authentication failed with the AI service. Please ensure a valid API key is configured \
     under upstream.api_key."
        .to_string()
}
fn default_model_not_found() -> String {
    "The AI model \"{model}\" was not found on the AI service. Please sync your models or \
     select a different agent."
        .to_string()
}
fn default_connection_refused() -> String {
    "I cannot connect to the AI service at {base_url}. Please ensure it is running and \
     accessible."
        .to_string()
}
fn default_upstream_detail() -> String {
    "AI service error: {detail}".to_string()
}
fn default_generic() -> String {
    "I apologize, but I'm having trouble connecting to the AI service. Error: {error}".to_string()
}
fn default_empty_response() -> String {
    "The AI service returned an empty response. Please try again.".to_string()
}

impl Default for FallbackMessages {
    fn default() -> Self {
        Self {
            authentication_failed: default_authentication_failed(),
            model_not_found: default_model_not_found(),
            connection_refused: default_connection_refused(),
            upstream_detail: default_upstream_detail(),
            generic: default_generic(),
            empty_response: default_empty_response(),
        }
    }
}

/// Which [`crate::store::ChatStore`] implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageBackend::Sqlite => write!(f, "sqlite"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Bounded retry used when opening the store at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_base_ms() -> u64 {
    200
}
fn default_retry_backoff_max_ms() -> u64 {
    2_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            backoff_base_ms: default_retry_backoff_base_ms(),
            backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_storage_path")]
    pub path: String,
    #[serde(default)]
    pub open_retry: RetryConfig,
}

fn default_storage_path() -> String {
    "chat-relay.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            open_retry: RetryConfig::default(),
        }
    }
}

/// One bearer key and the user it identifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdentityConfig {
    pub key: String,
    pub user_id: i64,
}

/// Client identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientAuthConfig {
    #[serde(default)]
    pub users: Vec<ClientIdentityConfig>,
}

/// Extra instruction appended to an agent's system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStyle {
    #[default]
    Direct,
    Casual,
    Parables,
    KingJames,
}

impl fmt::Display for ResponseStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStyle::Direct => write!(f, "direct"),
            ResponseStyle::Casual => write!(f, "casual"),
            ResponseStyle::Parables => write!(f, "parables"),
            ResponseStyle::KingJames => write!(f, "king_james"),
        }
    }
}

/// A chat agent: which model answers and how it is prompted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: i64,
    pub name: String,
    pub model: String,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub response_style: ResponseStyle,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_prompt_template() -> String {
    "You are {agent_name}, a helpful assistant.".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_true() -> bool {
    true
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub fallback_messages: FallbackMessages,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Config file path from [`CONFIG_PATH_ENV`], or [`DEFAULT_CONFIG_PATH`].
#[must_use]
pub fn config_path_from_env() -> String {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}
