use crate::{broadcast::Subscription, connection::GatewayClient};
use claws_core::{ChatHistory, ChatMessage, Envelope, StreamEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Shared chat history fed by `chat.delta` / `chat.done` events.
#[derive(Clone, Default)]
pub struct StreamReassembler {
    history: Arc<Mutex<ChatHistory>>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `envelope` if it is a stream event. Returns the number of
    /// conversations it touched.
    pub fn handle(&self, envelope: &Envelope) -> usize {
        let Some(event) = StreamEvent::from_envelope(envelope) else {
            return 0;
        };
        let touched = self.lock().apply(&event);
        if touched == 0 {
            debug!("stream_event_unclaimed: {event:?}");
        }
        touched
    }

    pub fn attach(&self, client: &GatewayClient) -> Subscription {
        let reassembler = self.clone();
        client.subscribe(move |envelope| {
            reassembler.handle(envelope);
        })
    }

    pub fn begin_exchange(&self, key: &str, user_text: &str) -> String {
        self.lock().begin_exchange(key, user_text)
    }

    pub fn update_message(&self, id: &str, content: &str, done: bool) -> bool {
        self.lock().update_message(id, content, done)
    }

    pub fn messages(&self, key: &str) -> Vec<ChatMessage> {
        self.lock().messages(key).to_vec()
    }

    pub fn find(&self, id: &str) -> Option<ChatMessage> {
        self.lock().find(id).cloned()
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        self.lock().is_streaming(id)
    }

    pub fn snapshot(&self) -> ChatHistory {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, ChatHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claws_core::Role;
    use serde_json::json;

    #[test]
    fn deltas_accumulate_into_the_pending_reply() {
        let reassembler = StreamReassembler::new();
        let reply = reassembler.begin_exchange("agent:main:main", "hi");

        reassembler.handle(&Envelope::event("chat.delta", json!({"text": "Hel"})));
        reassembler.handle(&Envelope::event("chat.delta", json!({"chunk": "lo"})));
        assert!(reassembler.is_streaming(&reply));

        reassembler.handle(&Envelope::event("chat.done", json!({})));
        let messages = reassembler.messages("agent:main:main");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "Hello");
        assert!(!reassembler.is_streaming(&reply));
        assert_eq!(reassembler.snapshot().active_stream(), None);
    }

    #[test]
    fn unrelated_frames_are_ignored() {
        let reassembler = StreamReassembler::new();
        reassembler.begin_exchange("agent:reef:main", "ping");
        assert_eq!(
            reassembler.handle(&Envelope::event("presence", json!({"text": "x"}))),
            0
        );
        assert_eq!(
            reassembler.handle(&Envelope::request("r-1-0", "chat.delta", json!({"text": "x"}))),
            0
        );
        assert_eq!(reassembler.messages("agent:reef:main")[1].content, "");
    }

    #[test]
    fn update_message_records_failure_text() {
        let reassembler = StreamReassembler::new();
        let reply = reassembler.begin_exchange("agent:trib:main", "status?");
        assert!(reassembler.update_message(&reply, "Error: connection closed", true));
        let message = reassembler.find(&reply).unwrap();
        assert_eq!(message.content, "Error: connection closed");
        assert!(!message.streaming);
    }
}
