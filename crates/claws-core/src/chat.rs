use crate::wire::{Envelope, EventFrame};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub streaming: bool,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: format!("user-{now}-{}", short_nonce()),
            role: Role::User,
            content: content.into(),
            timestamp: now,
            streaming: false,
        }
    }

    /// Empty assistant reply that will be filled by stream deltas.
    pub fn pending_assistant() -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: format!("assistant-{now}-{}", short_nonce()),
            role: Role::Assistant,
            content: String::new(),
            timestamp: now,
            streaming: true,
        }
    }
}

fn short_nonce() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// A streaming signal pulled out of a gateway event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta {
        fragment: String,
        session_key: Option<String>,
    },
    Done {
        session_key: Option<String>,
    },
}

impl StreamEvent {
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        match envelope {
            Envelope::Event(frame) => Self::from_event(frame),
            _ => None,
        }
    }

    pub fn from_event(frame: &EventFrame) -> Option<Self> {
        let session_key = frame
            .payload
            .get("sessionKey")
            .and_then(Value::as_str)
            .map(str::to_string);
        match frame.event.as_str() {
            "chat.delta" | "delta" => {
                let fragment = ["text", "chunk"]
                    .iter()
                    .filter_map(|key| frame.payload.get(*key).and_then(Value::as_str))
                    .find(|text| !text.is_empty())?;
                Some(StreamEvent::Delta {
                    fragment: fragment.to_string(),
                    session_key,
                })
            }
            "chat.done" | "done" => Some(StreamEvent::Done { session_key }),
            _ => None,
        }
    }
}

/// Conversation buckets keyed by session key, plus the global streaming marker.
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    buckets: BTreeMap<String, Vec<ChatMessage>>,
    active_stream: Option<String>,
}

impl ChatHistory {
    pub fn push(&mut self, key: &str, message: ChatMessage) {
        if message.streaming {
            self.active_stream = Some(message.id.clone());
        }
        self.buckets.entry(key.to_string()).or_default().push(message);
    }

    /// Records the user's prompt and an empty streaming reply; returns the reply id.
    pub fn begin_exchange(&mut self, key: &str, user_text: &str) -> String {
        let reply = ChatMessage::pending_assistant();
        let reply_id = reply.id.clone();
        self.push(key, ChatMessage::user(user_text));
        self.push(key, reply);
        reply_id
    }

    pub fn messages(&self, key: &str) -> &[ChatMessage] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn active_stream(&self) -> Option<&str> {
        self.active_stream.as_deref()
    }

    pub fn find(&self, id: &str) -> Option<&ChatMessage> {
        self.buckets
            .values()
            .flat_map(|messages| messages.iter())
            .find(|message| message.id == id)
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        self.find(id).map(|message| message.streaming).unwrap_or(false)
    }

    /// Applies one stream event. Returns the number of buckets touched.
    pub fn apply(&mut self, event: &StreamEvent) -> usize {
        match event {
            StreamEvent::Delta {
                fragment,
                session_key,
            } => self.append_delta(session_key.as_deref(), fragment),
            StreamEvent::Done { session_key } => self.finish_streams(session_key.as_deref()),
        }
    }

    /// Appends `fragment` to the last message of every bucket whose last
    /// message is still streaming. A `target` naming a known bucket narrows
    /// this to that bucket alone.
    pub fn append_delta(&mut self, target: Option<&str>, fragment: &str) -> usize {
        if fragment.is_empty() {
            return 0;
        }
        let mut touched = 0;
        for message in self.streaming_tails(target) {
            message.content.push_str(fragment);
            touched += 1;
        }
        touched
    }

    pub fn finish_streams(&mut self, target: Option<&str>) -> usize {
        let mut touched = 0;
        for message in self.streaming_tails(target) {
            message.streaming = false;
            touched += 1;
        }
        self.active_stream = None;
        touched
    }

    /// Replaces the content of message `id` wherever it lives.
    pub fn update_message(&mut self, id: &str, content: &str, done: bool) -> bool {
        let mut found = false;
        for message in self
            .buckets
            .values_mut()
            .flat_map(|messages| messages.iter_mut())
            .filter(|message| message.id == id)
        {
            message.content = content.to_string();
            message.streaming = !done;
            found = true;
        }
        if done {
            self.active_stream = None;
        }
        found
    }

    fn streaming_tails<'a>(
        &'a mut self,
        target: Option<&str>,
    ) -> impl Iterator<Item = &'a mut ChatMessage> + 'a {
        let target = target
            .filter(|key| self.buckets.contains_key(*key))
            .map(str::to_string);
        self.buckets
            .iter_mut()
            .filter(move |(key, _)| target.as_deref().map_or(true, |t| t == key.as_str()))
            .filter_map(|(_, messages)| messages.last_mut())
            .filter(|message| message.streaming)
    }
}
