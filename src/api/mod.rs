pub mod health;
pub mod messages;
pub mod threads;

use serde::de::DeserializeOwned;

use crate::error::RelayError;

/// Parse a JSON request body. An empty body parses as `{}`.
pub(crate) fn parse_json_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, RelayError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body)
        .map_err(|err| RelayError::InvalidRequest(format!("Invalid JSON body: {err}")))
}

/// Accept `agentId` as a JSON number or a numeric string.
pub(crate) fn agent_id_from_value(value: Option<&serde_json::Value>) -> Option<i64> {
    match value? {
        serde_json::Value::Number(number) => number.as_i64(),
        serde_json::Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
