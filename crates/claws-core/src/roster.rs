use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentProfile {
    pub id: &'static str,
    pub name: &'static str,
    pub emoji: &'static str,
    pub color: &'static str,
    pub role: &'static str,
    pub session_key: &'static str,
}

pub const AGENTS: &[AgentProfile] = &[
    AgentProfile {
        id: "main",
        name: "Ceph",
        emoji: "🐙",
        color: "#00d4ff",
        role: "Lead Builder Agent",
        session_key: "agent:main:main",
    },
    AgentProfile {
        id: "trib",
        name: "Tributary",
        emoji: "🦑",
        color: "#4f46e5",
        role: "Intel & Analysis",
        session_key: "agent:trib:main",
    },
    AgentProfile {
        id: "reef",
        name: "Reef",
        emoji: "🪸",
        color: "#10b981",
        role: "Operator & UI",
        session_key: "agent:reef:main",
    },
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub last_activity: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentPresence {
    pub profile: &'static AgentProfile,
    pub online: bool,
    pub active_sessions: usize,
}

pub fn find_agent(id: &str) -> Option<&'static AgentProfile> {
    let id = id.trim();
    AGENTS
        .iter()
        .find(|agent| agent.id.eq_ignore_ascii_case(id) || agent.name.eq_ignore_ascii_case(id))
}

/// Agent id embedded in an `agent:<id>:<rest>` session key.
pub fn agent_id_from_session_key(key: &str) -> Option<&str> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^agent:(\w+):").ok())
        .as_ref()?;
    pattern
        .captures(key)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// `sessions.list` replies either with a bare array or `{ "sessions": [...] }`.
/// Entries that do not look like sessions are skipped.
pub fn parse_session_list(value: &Value) -> Vec<Session> {
    let entries: &[Value] = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("sessions") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    entries
        .iter()
        .filter(|entry| entry.is_object())
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect()
}

pub fn fleet_presence(sessions: &[Session]) -> Vec<AgentPresence> {
    AGENTS
        .iter()
        .map(|profile| {
            let prefix = format!("agent:{}:", profile.id);
            let active_sessions = sessions
                .iter()
                .filter(|session| session.key.starts_with(&prefix))
                .count();
            AgentPresence {
                profile,
                online: active_sessions > 0,
                active_sessions,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_list_accepts_both_reply_shapes() {
        let wrapped = json!({"sessions": [
            {"key": "agent:main:main", "agentId": "main", "kind": "direct", "lastActivity": "2026-10-16T08:00:00Z"},
            {"key": "agent:reef:cron", "agentId": "reef", "kind": "cron", "lastActivity": 1760601600000u64, "channel": "slack"}
        ]});
        let sessions = parse_session_list(&wrapped);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[1].channel.as_deref(), Some("slack"));

        let bare = json!([{"key": "agent:trib:main"}, "junk", 7]);
        let sessions = parse_session_list(&bare);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].key, "agent:trib:main");

        assert!(parse_session_list(&json!({"other": true})).is_empty());
    }

    #[test]
    fn presence_counts_sessions_by_key_prefix() {
        let sessions = parse_session_list(&json!([
            {"key": "agent:main:main"},
            {"key": "agent:main:subtask-1"},
            {"key": "agent:reef:main"},
            {"key": "agent:mainframe:main"}
        ]));
        let presence = fleet_presence(&sessions);
        let by_id = |id: &str| presence.iter().find(|p| p.profile.id == id).copied().unwrap();
        assert_eq!(by_id("main").active_sessions, 2);
        assert!(by_id("reef").online);
        assert!(!by_id("trib").online);
        assert_eq!(by_id("trib").active_sessions, 0);
    }

    #[test]
    fn session_keys_map_to_agents() {
        assert_eq!(agent_id_from_session_key("agent:reef:main"), Some("reef"));
        assert_eq!(agent_id_from_session_key("cron:reef:main"), None);
        assert_eq!(find_agent("Ceph").map(|a| a.id), Some("main"));
        assert_eq!(find_agent(" trib ").map(|a| a.name), Some("Tributary"));
        assert!(find_agent("kraken").is_none());
    }
}
