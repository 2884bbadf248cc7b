//! Topic → handler registry.
//!
//! Handlers for a topic run in registration order. A topic whose last handler
//! is removed disappears from the map entirely.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::models::Topic;

pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct TopicRegistry {
    next_id: u64,
    topics: HashMap<Topic, Vec<(SubscriptionId, Handler)>>,
}

impl TopicRegistry {
    pub fn insert(&mut self, topic: Topic, handler: Handler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.topics.entry(topic).or_default().push((id, handler));
        id
    }

    /// Removes one registration. Unknown ids are a no-op.
    pub fn remove(&mut self, topic: Topic, id: SubscriptionId) -> bool {
        let Some(handlers) = self.topics.get_mut(&topic) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.topics.remove(&topic);
        }
        removed
    }

    pub fn remove_topic(&mut self, topic: Topic) {
        self.topics.remove(&topic);
    }

    pub fn clear(&mut self) {
        self.topics.clear();
    }

    /// Snapshot of a topic's handlers, in invocation order.
    pub fn handlers(&self, topic: Topic) -> Vec<Handler> {
        self.topics
            .get(&topic)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.topics.get(&topic).map_or(0, Vec::len)
    }

    #[allow(dead_code)]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Owner-side handle for one registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription immediately unsubscribes its handler"]
pub struct Subscription {
    topic: Topic,
    id: SubscriptionId,
    cancel: Option<Box<dyn FnOnce(Topic, SubscriptionId) + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(
        topic: Topic,
        id: SubscriptionId,
        cancel: impl FnOnce(Topic, SubscriptionId) + Send + Sync + 'static,
    ) -> Self {
        Self {
            topic,
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    #[allow(dead_code)]
    pub fn topic(&self) -> Topic {
        self.topic
    }

    #[allow(dead_code)]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Explicit form of dropping the handle.
    #[allow(dead_code)]
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel(self.topic, self.id);
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_: &Value| Ok(()))
    }

    #[test]
    fn test_handlers_keep_registration_order() {
        let mut registry = TopicRegistry::default();
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let calls = Arc::clone(&calls);
            registry.insert(
                Topic::Status,
                Arc::new(move |_: &Value| {
                    calls.lock().unwrap().push(label);
                    Ok(())
                }),
            );
        }

        for handler in registry.handlers(Topic::Status) {
            handler(&Value::Null).unwrap();
        }
        assert_eq!(*calls.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_removing_last_handler_drops_topic_entry() {
        let mut registry = TopicRegistry::default();
        let first = registry.insert(Topic::Progress, noop());
        let second = registry.insert(Topic::Progress, noop());
        assert_eq!(registry.topic_count(), 1);

        assert!(registry.remove(Topic::Progress, first));
        assert_eq!(registry.handler_count(Topic::Progress), 1);
        assert!(registry.remove(Topic::Progress, second));
        assert_eq!(registry.topic_count(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = TopicRegistry::default();
        let id = registry.insert(Topic::Record, noop());
        assert!(registry.remove(Topic::Record, id));
        assert!(!registry.remove(Topic::Record, id));
        assert!(!registry.remove(Topic::Error, id));
    }

    #[test]
    fn test_ids_are_scoped_to_their_topic() {
        let mut registry = TopicRegistry::default();
        let id = registry.insert(Topic::Success, noop());
        assert!(!registry.remove(Topic::Error, id));
        assert_eq!(registry.handler_count(Topic::Success), 1);
    }

    #[test]
    fn test_subscription_drop_runs_cancel_once() {
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let sub = Subscription::new(Topic::Status, SubscriptionId(7), move |topic, id| {
            assert_eq!(topic, Topic::Status);
            assert_eq!(id, SubscriptionId(7));
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
