use crate::error::RequestError;
use chrono::Utc;
use claws_core::ResponseFrame;
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tokio::{sync::oneshot, time::Instant};
use tracing::debug;

pub type Reply = oneshot::Sender<Result<Value, RequestError>>;

struct PendingRequest {
    method: String,
    created_at: Instant,
    deadline: Instant,
    reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub id: String,
    pub method: String,
    pub age: Duration,
}

/// Outstanding requests keyed by id. Every entry leaves the table exactly
/// once: on its response, on its deadline, or when the connection drops.
pub struct Correlator {
    next_seq: u64,
    timeout: Duration,
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_seq: 0,
            timeout,
            pending: HashMap::new(),
        }
    }

    /// `<prefix>-<seq>-<unix-millis>`; the sequence never rewinds, so ids
    /// stay unique across reconnects.
    pub fn next_id(&mut self, prefix: &str) -> String {
        self.next_seq = self.next_seq.saturating_add(1);
        format!("{prefix}-{}-{}", self.next_seq, Utc::now().timestamp_millis())
    }

    pub fn register(&mut self, method: &str, reply: Reply) -> String {
        let id = self.next_id("r");
        let created_at = Instant::now();
        self.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                created_at,
                deadline: created_at + self.timeout,
                reply,
            },
        );
        id
    }

    /// Settles the request matching `frame.id`. Returns false for unknown ids.
    pub fn resolve(&mut self, frame: &ResponseFrame) -> bool {
        let Some(entry) = self.pending.remove(&frame.id) else {
            debug!("response_unmatched: id={}", frame.id);
            return false;
        };
        let outcome = if frame.ok {
            Ok(frame.payload.clone().unwrap_or(Value::Null))
        } else {
            Err(RequestError::Rejected {
                method: entry.method,
                detail: frame.error_detail(),
            })
        };
        let _ = entry.reply.send(outcome);
        true
    }

    /// Fails the request with `err` without waiting for a response.
    pub fn fail(&mut self, id: &str, err: RequestError) -> bool {
        match self.pending.remove(id) {
            Some(entry) => {
                let _ = entry.reply.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Times out every request whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            if let Some(entry) = self.pending.remove(id) {
                debug!("request_timeout: id={id} method={}", entry.method);
                let _ = entry
                    .reply
                    .send(Err(RequestError::timeout(&entry.method, self.timeout)));
            }
        }
        due.len()
    }

    pub fn reject_all(&mut self, err: RequestError) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry.reply.send(Err(err.clone()));
        }
        count
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|entry| entry.deadline).min()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let mut rows: Vec<PendingSummary> = self
            .pending
            .iter()
            .map(|(id, entry)| PendingSummary {
                id: id.clone(),
                method: entry.method.clone(),
                age: now.saturating_duration_since(entry.created_at),
            })
            .collect();
        rows.sort_by(|a, b| b.age.cmp(&a.age).then_with(|| a.id.cmp(&b.id)));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn response(id: &str, ok: bool, payload: Option<Value>) -> ResponseFrame {
        ResponseFrame {
            id: id.to_string(),
            ok,
            payload,
            error: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn ids_are_distinct_and_prefixed() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let a = correlator.next_id("auth");
        let b = correlator.next_id("r");
        assert!(a.starts_with("auth-1-"));
        assert!(b.starts_with("r-2-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn ok_response_resolves_payload() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let (tx, rx) = oneshot::channel();
        let id = correlator.register("sessions.list", tx);

        assert!(correlator.resolve(&response(&id, true, Some(json!({"sessions": []})))));
        assert_eq!(rx.await.unwrap(), Ok(json!({"sessions": []})));
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn negative_response_carries_detail_verbatim() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let (tx, rx) = oneshot::channel();
        let id = correlator.register("chat.send", tx);

        let detail = json!({"code": "INVALID_REQUEST", "message": "sessionKey required"});
        correlator.resolve(&response(&id, false, Some(detail.clone())));
        assert_eq!(
            rx.await.unwrap(),
            Err(RequestError::Rejected {
                method: "chat.send".to_string(),
                detail,
            })
        );
    }

    #[tokio::test]
    async fn unknown_and_repeated_ids_are_ignored() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let (tx, rx) = oneshot::channel();
        let id = correlator.register("status", tx);

        assert!(!correlator.resolve(&response("r-999-0", true, None)));
        assert!(correlator.contains(&id));

        assert!(correlator.resolve(&response(&id, true, None)));
        assert!(!correlator.resolve(&response(&id, true, Some(json!("again")))));
        assert_eq!(rx.await.unwrap(), Ok(Value::Null));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_only_removes_due_requests() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let (early_tx, early_rx) = oneshot::channel();
        let early = correlator.register("sessions.list", early_tx);
        tokio::time::advance(Duration::from_secs(10)).await;
        let (late_tx, _late_rx) = oneshot::channel();
        let late = correlator.register("status", late_tx);

        assert_eq!(correlator.next_deadline(), Some(Instant::now() + Duration::from_secs(20)));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(correlator.expire(Instant::now()), 1);

        assert!(!correlator.contains(&early));
        assert!(correlator.contains(&late));
        assert_eq!(
            early_rx.await.unwrap(),
            Err(RequestError::Timeout {
                method: "sessions.list".to_string(),
                timeout_ms: 30_000,
            })
        );
    }

    #[tokio::test]
    async fn reject_all_drains_everything() {
        let mut correlator = Correlator::new(Duration::from_secs(30));
        let receivers: Vec<_> = (0..3)
            .map(|_| {
                let (tx, rx) = oneshot::channel();
                correlator.register("status", tx);
                rx
            })
            .collect();
        assert_eq!(correlator.reject_all(RequestError::ConnectionClosed), 3);
        assert!(correlator.is_empty());
        assert_eq!(correlator.next_deadline(), None);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(RequestError::ConnectionClosed));
        }
    }
}
