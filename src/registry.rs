//! Topic subscription registry.
//!
//! Maps each topic to the handlers registered for it, in registration
//! order. Every handler of a topic receives every message for that topic.
//! A topic stays registered after its last handler is disposed; only an
//! explicit unsubscribe removes it, mirroring the server-side subscription.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{trace, warn};

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

/// Receives messages for a topic.
///
/// Implemented for any `Fn(&Message)` closure.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

struct Entry {
    id: u64,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct RegistryInner {
    topics: RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn remove(&self, topic: &str, id: u64) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = topics.get_mut(topic) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        before != entries.len()
    }
}

/// Thread-safe topic registry. Clones share the same state.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

/// Result of registering a handler.
pub struct Registration {
    pub subscription: Subscription,
    /// True when the topic had no registry entry before this handler.
    pub first: bool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `topic`, after any existing handlers.
    pub fn add<H: MessageHandler>(&self, topic: &str, handler: H) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            id,
            handler: Arc::new(handler),
        };

        let first = {
            let mut topics = self.inner.topics.write().unwrap_or_else(|e| e.into_inner());
            match topics.get_mut(topic) {
                Some(entries) => {
                    entries.push(entry);
                    false
                }
                None => {
                    topics.insert(topic.to_string(), vec![entry]);
                    true
                }
            }
        };
        trace!(topic, id, first, "Registered handler");

        Registration {
            subscription: Subscription {
                registry: Arc::downgrade(&self.inner),
                topic: topic.to_string(),
                id,
                disposed: false,
            },
            first,
        }
    }

    /// Invoke every handler registered for the message's topic, in order.
    ///
    /// A panicking handler is logged and skipped; later handlers still run.
    /// Returns the number of handlers invoked.
    pub fn publish_locally(&self, message: &Message) -> usize {
        // Snapshot so handlers may subscribe or dispose without deadlocking.
        let handlers: Vec<Arc<dyn MessageHandler>> = {
            let topics = self.inner.topics.read().unwrap_or_else(|e| e.into_inner());
            match topics.get(&message.topic) {
                Some(entries) => entries.iter().map(|e| Arc::clone(&e.handler)).collect(),
                None => return 0,
            }
        };

        for handler in &handlers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message)));
            if result.is_err() {
                warn!(topic = %message.topic, "Subscriber handler panicked");
            }
        }
        handlers.len()
    }

    /// All registered topics, including ones whose handlers were all disposed.
    pub fn topics(&self) -> Vec<String> {
        let topics = self.inner.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, topic: &str) -> usize {
        let topics = self.inner.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, topic: &str) -> bool {
        let topics = self.inner.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.contains_key(topic)
    }

    /// Forget a topic and all of its handlers.
    pub fn remove_topic(&self, topic: &str) -> bool {
        let mut topics = self.inner.topics.write().unwrap_or_else(|e| e.into_inner());
        topics.remove(topic).is_some()
    }
}

/// Disposer for a registered handler.
///
/// Dropping it removes exactly the handler it was returned for.
#[must_use = "dropping a Subscription removes its handler"]
pub struct Subscription {
    registry: Weak<RegistryInner>,
    topic: String,
    id: u64,
    disposed: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(&self.topic, self.id) {
                trace!(topic = %self.topic, id = self.id, "Removed handler");
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}
