use rustc_hash::FxHashSet;

use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// An empty agent list or identity table is valid: the service then starts in
/// the not-installed state instead of refusing to boot.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_relay(config)?;
    validate_storage(config)?;
    validate_identities(config)?;
    validate_agents(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    if let Some(max_blocking_threads) = server.runtime_max_blocking_threads {
        if max_blocking_threads == 0 {
            return Err(validation_err(
                "server.runtime_max_blocking_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    let parsed = url::Url::parse(&upstream.base_url)
        .map_err(|err| validation_err(format!("upstream.base_url is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(
            "upstream.base_url must start with http:// or https://",
        ));
    }
    if upstream.first_byte_timeout_secs == 0 {
        return Err(validation_err(
            "upstream.first_byte_timeout_secs must be greater than 0",
        ));
    }
    if upstream.stream_timeout_secs == 0 {
        return Err(validation_err(
            "upstream.stream_timeout_secs must be greater than 0",
        ));
    }
    if let Some(proxy) = upstream.proxy.as_deref() {
        let proxy = proxy.trim();
        if proxy.is_empty() {
            return Err(validation_err("upstream.proxy cannot be empty when set"));
        }
        let scheme = url::Url::parse(proxy)
            .map_err(|err| validation_err(format!("upstream.proxy is not a valid URL: {err}")))?
            .scheme()
            .to_ascii_lowercase();
        if !matches!(scheme.as_str(), "http" | "https" | "socks5" | "socks5h") {
            return Err(validation_err(format!(
                "upstream.proxy has unsupported scheme '{scheme}'"
            )));
        }
    }
    Ok(())
}

fn validate_relay(config: &AppConfig) -> Result<(), ConfigError> {
    if config.relay.history_window == 0 {
        return Err(validation_err("relay.history_window must be at least 1"));
    }
    if config.relay.channel_capacity == 0 {
        return Err(validation_err("relay.channel_capacity must be at least 1"));
    }
    Ok(())
}

fn validate_storage(config: &AppConfig) -> Result<(), ConfigError> {
    let storage = &config.storage;
    if storage.path.trim().is_empty() {
        return Err(validation_err("storage.path cannot be empty"));
    }
    if storage.open_retry.max_attempts == 0 {
        return Err(validation_err(
            "storage.open_retry.max_attempts must be at least 1",
        ));
    }
    if storage.open_retry.backoff_base_ms > storage.open_retry.backoff_max_ms {
        return Err(validation_err(
            "storage.open_retry.backoff_base_ms cannot exceed backoff_max_ms",
        ));
    }
    Ok(())
}

fn validate_identities(config: &AppConfig) -> Result<(), ConfigError> {
    let mut seen = FxHashSet::default();
    for identity in &config.client_authentication.users {
        if identity.key.trim().is_empty() {
            return Err(validation_err(
                "client_authentication.users contains an empty key",
            ));
        }
        if !seen.insert(identity.key.as_str()) {
            return Err(validation_err(format!(
                "client_authentication.users: key for user {} is listed twice",
                identity.user_id
            )));
        }
    }
    Ok(())
}

fn validate_agents(config: &AppConfig) -> Result<(), ConfigError> {
    let mut seen = FxHashSet::default();
    for agent in &config.agents {
        if !seen.insert(agent.id) {
            return Err(validation_err(format!("Duplicate agent id {}", agent.id)));
        }
        if agent.name.trim().is_empty() {
            return Err(validation_err(format!(
                "Agent {}: name cannot be empty",
                agent.id
            )));
        }
        if agent.model.trim().is_empty() {
            return Err(validation_err(format!(
                "Agent '{}': model cannot be empty",
                agent.name
            )));
        }
        if !(0.0..=2.0).contains(&agent.temperature) {
            return Err(validation_err(format!(
                "Agent '{}': temperature must be within 0.0..=2.0",
                agent.name
            )));
        }
        if agent.max_tokens == 0 {
            return Err(validation_err(format!(
                "Agent '{}': max_tokens must be greater than 0",
                agent.name
            )));
        }
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "Invalid log_level '{}'. Must be one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}
