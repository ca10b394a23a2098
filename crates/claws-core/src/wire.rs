use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
pub const CHALLENGE_EVENT: &str = "connect.challenge";
pub const CONNECTION_STATUS_EVENT: &str = "connection.status";
pub const CONNECT_METHOD: &str = "connect";

/// One frame on the gateway socket, tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFrame {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseFrame {
    /// Error detail of a negative response: `payload` verbatim, else `error`.
    pub fn error_detail(&self) -> Value {
        self.payload
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Envelope::Req(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
            extra: Map::new(),
        })
    }

    pub fn event(event: impl Into<String>, payload: Value) -> Self {
        Envelope::Event(EventFrame {
            event: event.into(),
            payload,
            extra: Map::new(),
        })
    }

    /// Synthetic `connection.status` notification emitted by the client itself.
    pub fn status(status: ConnectionStatus) -> Self {
        Self::event(
            CONNECTION_STATUS_EVENT,
            serde_json::json!({ "status": status.as_str() }),
        )
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            Envelope::Event(frame) => Some(frame.event.as_str()),
            _ => None,
        }
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        let Envelope::Event(frame) = self else {
            return None;
        };
        if frame.event != CONNECTION_STATUS_EVENT {
            return None;
        }
        frame.payload.get("status")?.as_str()?.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connecting,
    WaitingChallenge,
    Connected,
    AuthFailed,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::WaitingChallenge => "waiting-challenge",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::AuthFailed => "auth-failed",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "connecting" => Ok(ConnectionStatus::Connecting),
            "waiting-challenge" | "waiting_challenge" => Ok(ConnectionStatus::WaitingChallenge),
            "connected" => Ok(ConnectionStatus::Connected),
            "auth-failed" | "auth_failed" => Ok(ConnectionStatus::AuthFailed),
            "disconnected" => Ok(ConnectionStatus::Disconnected),
            other => Err(format!("Unknown connection status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("frame exceeds max size: {size} > {max}")]
    Oversized { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    encode_with_limit(envelope, DEFAULT_MAX_FRAME_BYTES)
}

pub fn encode_with_limit(envelope: &Envelope, max_frame_bytes: usize) -> Result<String, CodecError> {
    let encoded =
        serde_json::to_string(envelope).map_err(|err| CodecError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(CodecError::Oversized {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode(text: &str) -> Result<Envelope, CodecError> {
    decode_with_limit(text, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_with_limit(text: &str, max_frame_bytes: usize) -> Result<Envelope, CodecError> {
    if text.len() > max_frame_bytes {
        return Err(CodecError::Oversized {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(text).map_err(|err| CodecError::Decode(err.to_string()))
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_each_frame_shape() {
        let req = decode(r#"{"type":"req","id":"r-1-5","method":"sessions.list","params":{}}"#)
            .expect("req");
        assert!(matches!(req, Envelope::Req(ref frame) if frame.method == "sessions.list"));

        let res = decode(r#"{"type":"res","id":"r-1-5","ok":true,"payload":{"sessions":[]}}"#)
            .expect("res");
        match res {
            Envelope::Res(frame) => {
                assert_eq!(frame.id, "r-1-5");
                assert!(frame.ok);
                assert_eq!(frame.payload, Some(json!({"sessions": []})));
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let event = decode(r#"{"type":"event","event":"chat.delta","payload":{"text":"Hel"}}"#)
            .expect("event");
        assert_eq!(event.event_name(), Some("chat.delta"));
    }

    #[test]
    fn unknown_fields_survive_re_encoding() {
        let raw = r#"{"type":"event","event":"presence","payload":{"n":1},"seq":42,"stateVersion":{"presence":3}}"#;
        let decoded = decode(raw).expect("decode");
        let Envelope::Event(frame) = &decoded else {
            panic!("expected event");
        };
        assert_eq!(frame.extra.get("seq"), Some(&json!(42)));

        let reencoded: Value = serde_json::from_str(&encode(&decoded).expect("encode")).unwrap();
        assert_eq!(reencoded["seq"], json!(42));
        assert_eq!(reencoded["stateVersion"], json!({"presence": 3}));
        assert_eq!(reencoded["type"], json!("event"));
    }

    #[test]
    fn malformed_frames_are_decode_errors() {
        for raw in [
            "not json",
            r#"{"type":"res"}"#,
            r#"{"type":"bogus","id":"1"}"#,
            r#"{"event":"chat.delta"}"#,
            r#"{"type":"res","id":{"nested":true},"ok":true}"#,
        ] {
            assert!(
                matches!(decode(raw), Err(CodecError::Decode(_))),
                "expected decode failure for {raw}"
            );
        }
    }

    #[test]
    fn numeric_ids_are_normalized_and_ok_defaults_false() {
        let decoded = decode(r#"{"type":"res","id":17,"error":{"code":"denied"}}"#).expect("decode");
        let Envelope::Res(frame) = decoded else {
            panic!("expected response");
        };
        assert_eq!(frame.id, "17");
        assert!(!frame.ok);
        assert_eq!(frame.error_detail(), json!({"code": "denied"}));
    }

    #[test]
    fn error_detail_prefers_payload() {
        let frame = ResponseFrame {
            id: "r-2-1".to_string(),
            ok: false,
            payload: Some(json!({"message": "bad params"})),
            error: Some(json!("ignored")),
            extra: Map::new(),
        };
        assert_eq!(frame.error_detail(), json!({"message": "bad params"}));
    }

    #[test]
    fn size_limit_applies_both_ways() {
        let big = Envelope::event("blob", json!({"data": "x".repeat(256)}));
        assert!(matches!(
            encode_with_limit(&big, 64),
            Err(CodecError::Oversized { .. })
        ));
        let text = encode(&big).expect("encode");
        assert!(matches!(
            decode_with_limit(&text, 64),
            Err(CodecError::Oversized { .. })
        ));
    }

    #[test]
    fn status_events_parse_back() {
        let envelope = Envelope::status(ConnectionStatus::AuthFailed);
        assert_eq!(envelope.connection_status(), Some(ConnectionStatus::AuthFailed));
        let text = encode(&envelope).expect("encode");
        assert!(text.contains("\"auth-failed\""));
        assert_eq!(
            Envelope::event("chat.done", json!({})).connection_status(),
            None
        );
    }
}
