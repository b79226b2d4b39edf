use http::header::AUTHORIZATION;
use rustc_hash::FxHashMap;

use crate::config::AppConfig;
use crate::error::RelayError;
use crate::store::UserId;

/// Bearer key index resolving a client to its user id.
#[derive(Debug, Default)]
pub struct ClientIdentities {
    by_key: FxHashMap<Box<str>, UserId>,
}

/// Extract the bearer token from `Authorization: Bearer <key>`.
///
/// # Errors
///
/// Returns `RelayError::Auth` when the header is missing, not UTF-8, or has no token.
pub fn extract_bearer(headers: &http::HeaderMap) -> Result<&str, RelayError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| RelayError::Auth("No token provided".to_string()))
}

impl ClientIdentities {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let by_key = config
            .client_authentication
            .users
            .iter()
            .map(|identity| (Box::from(identity.key.as_str()), identity.user_id))
            .collect();
        Self { by_key }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Resolve the calling user from request headers.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Auth` when the token is missing or unknown.
    pub fn authenticate(&self, headers: &http::HeaderMap) -> Result<UserId, RelayError> {
        let token = extract_bearer(headers)?;
        self.by_key
            .get(token)
            .copied()
            .ok_or_else(|| RelayError::Auth("Invalid or expired token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientAuthConfig, ClientIdentityConfig};

    fn identities() -> ClientIdentities {
        let config = AppConfig {
            client_authentication: ClientAuthConfig {
                users: vec![
                    ClientIdentityConfig {
                        key: "alice-key".to_string(),
                        user_id: 1,
                    },
                    ClientIdentityConfig {
                        key: "bob-key".to_string(),
                        user_id: 2,
                    },
                ],
            },
            ..AppConfig::default()
        };
        ClientIdentities::from_config(&config)
    }

    fn headers(value: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_bearer_resolves_user() {
        let ids = identities();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.authenticate(&headers("Bearer alice-key")).unwrap(), 1);
        assert_eq!(ids.authenticate(&headers("Bearer bob-key")).unwrap(), 2);
    }

    #[test]
    fn test_missing_token() {
        let err = identities()
            .authenticate(&http::HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "No token provided");
        let err = identities().authenticate(&headers("Bearer")).unwrap_err();
        assert_eq!(err.to_string(), "No token provided");
    }

    #[test]
    fn test_unknown_token() {
        let err = identities()
            .authenticate(&headers("Bearer mallory"))
            .unwrap_err();
        assert!(matches!(err, RelayError::Auth(_)));
        assert_eq!(err.to_string(), "Invalid or expired token");
    }

    #[test]
    fn test_empty_table_rejects_everyone() {
        let ids = ClientIdentities::default();
        assert!(ids.is_empty());
        assert!(ids.authenticate(&headers("Bearer anything")).is_err());
    }
}
