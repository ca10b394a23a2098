use claws_core::Envelope;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(u64, Callback)>,
}

/// Synchronous fan-out of inbound frames.
///
/// The registry lock is released before callbacks run, so a callback may
/// subscribe or unsubscribe (itself or others) without deadlocking. A
/// subscriber removed while a frame is being dispatched is skipped for the
/// rest of that frame.
#[derive(Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Delivers `envelope` to every subscriber in registration order.
    /// Returns how many callbacks ran.
    pub fn emit(&self, envelope: &Envelope) -> usize {
        let snapshot = lock(&self.registry).subscribers.clone();
        let mut delivered = 0;
        for (id, callback) in snapshot {
            if !self.is_registered(id) {
                continue;
            }
            callback(envelope);
            delivered += 1;
        }
        delivered
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_registered(&self, id: u64) -> bool {
        lock(&self.registry)
            .subscribers
            .iter()
            .any(|(existing, _)| *existing == id)
    }
}

/// Handle returned by [`Broadcaster::subscribe`]. Dropping it does not
/// unsubscribe; call [`Subscription::unsubscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Removes exactly this subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut registry = lock(&registry);
        let before = registry.subscribers.len();
        registry.subscribers.retain(|(id, _)| *id != self.id);
        registry.subscribers.len() != before
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
