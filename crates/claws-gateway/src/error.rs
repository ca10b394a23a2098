use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single `request` call. Never affects other callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("not connected")]
    NotConnected,
    #[error("request timeout: {method} after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("{method} rejected: {detail}")]
    Rejected { method: String, detail: Value },
    #[error("too many requests in flight (limit {limit})")]
    Backpressure { limit: usize },
    #[error("request encode failed: {0}")]
    Encode(String),
}

impl RequestError {
    pub(crate) fn timeout(method: &str, after: Duration) -> Self {
        RequestError::Timeout {
            method: method.to_string(),
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway not ready after {0:?}")]
    ReadyTimeout(Duration),
    #[error("gateway client shut down")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings serialize failed: {0}")]
    Serialize(#[from] toml::ser::Error),
}
