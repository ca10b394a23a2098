use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const PROTOCOL_VERSION: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            id: "webchat-ui".to_string(),
            version: "0.1.0".to_string(),
            platform: "web".to_string(),
            mode: "webchat".to_string(),
        }
    }
}

/// Behavior that does not come from the settings store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub client: ClientIdentity,
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub scopes: Vec<String>,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    /// `None` sends every request immediately regardless of how many are outstanding.
    pub max_in_flight: Option<usize>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            client: ClientIdentity::default(),
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            scopes: vec!["operator.write".to_string()],
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_in_flight: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthParams {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientIdentity,
    pub auth: AuthParams,
    pub scopes: Vec<String>,
}

impl GatewayConfig {
    pub fn connect_params(&self, token: &str) -> ConnectParams {
        ConnectParams {
            min_protocol: self.min_protocol,
            max_protocol: self.max_protocol,
            client: self.client.clone(),
            auth: AuthParams {
                token: token.to_string(),
            },
            scopes: self.scopes.clone(),
        }
    }

    pub(crate) fn connect_params_value(&self, token: &str) -> Value {
        serde_json::to_value(self.connect_params(token)).unwrap_or(Value::Null)
    }
}
