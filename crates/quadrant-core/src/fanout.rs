//! Event fan-out registry.
//!
//! Maps a topic to the set of subscriber entries currently interested in it.
//! Streaming implementations subscribe when their connection opens and
//! unsubscribe from the connection's close listener; [`EventRegistry::publish`]
//! invokes every subscriber whose filter accepts the event.
//!
//! Callbacks run outside the registry lock, so a subscriber may unsubscribe
//! itself (for example by closing its connection) while it is being invoked.
//! [`EventRegistry::unsubscribe`] marks the entry inactive and waits for any
//! invocation already running on another thread, so once it returns the
//! removed entry never runs again. Callbacks should stay short and
//! non-blocking (typically a channel send or
//! [`PushConnection::write`](crate::connection::PushConnection::write)).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use tracing::debug;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Filter<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type Topics<E> = HashMap<String, BTreeMap<u64, Arc<Entry<E>>>>;

struct Gate {
    active: bool,
    running: Vec<ThreadId>,
}

struct Entry<E> {
    callback: Callback<E>,
    filter: Option<Filter<E>>,
    gate: Mutex<Gate>,
    idle: Condvar,
}

impl<E> Entry<E> {
    fn new(callback: Callback<E>, filter: Option<Filter<E>>) -> Self {
        Self {
            callback,
            filter,
            gate: Mutex::new(Gate {
                active: true,
                running: Vec::new(),
            }),
            idle: Condvar::new(),
        }
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the callback unless the entry was removed. Returns whether it ran.
    fn deliver(&self, event: &E) -> bool {
        if !self.filter.as_ref().map_or(true, |accept| accept(event)) {
            return false;
        }

        let me = thread::current().id();
        {
            let mut gate = self.gate();
            if !gate.active {
                return false;
            }
            gate.running.push(me);
        }

        let _running = Running { entry: self, thread: me };
        (self.callback)(event);
        true
    }

    /// Stop future deliveries and wait out the ones running on other threads.
    /// A callback that removes its own entry does not wait on itself.
    fn deactivate(&self) {
        let me = thread::current().id();
        let mut gate = self.gate();
        gate.active = false;
        while gate.running.iter().any(|running| *running != me) {
            gate = self
                .idle
                .wait(gate)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Marks an invocation finished, also when the callback panics.
struct Running<'a, E> {
    entry: &'a Entry<E>,
    thread: ThreadId,
}

impl<E> Drop for Running<'_, E> {
    fn drop(&mut self) {
        let mut gate = self.entry.gate();
        if let Some(pos) = gate.running.iter().position(|t| *t == self.thread) {
            gate.running.swap_remove(pos);
        }
        drop(gate);
        self.entry.idle.notify_all();
    }
}

/// Handle identifying one subscriber entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    topic: String,
    id: u64,
}

impl SubscriptionKey {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Process-wide topic to subscriber mapping.
pub struct EventRegistry<E> {
    topics: Mutex<Topics<E>>,
    next_id: AtomicU64,
}

impl<E> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventRegistry<E> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to every event published on `topic`.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> SubscriptionKey
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(topic, Arc::new(callback), None)
    }

    /// Subscribe to the events on `topic` accepted by `filter`.
    pub fn subscribe_filtered<P, F>(&self, topic: &str, filter: P, callback: F) -> SubscriptionKey
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(topic, Arc::new(callback), Some(Arc::new(filter)))
    }

    /// Remove a subscriber entry. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, key: &SubscriptionKey) -> bool {
        let removed = {
            let mut topics = self.lock();
            let Some(entries) = topics.get_mut(&key.topic) else {
                return false;
            };
            let removed = entries.remove(&key.id);
            if entries.is_empty() {
                topics.remove(&key.topic);
            }
            removed
        };

        match removed {
            Some(entry) => {
                entry.deactivate();
                debug!("Unsubscribed {} from topic {}", key.id, key.topic);
                true
            }
            None => false,
        }
    }

    /// Deliver `event` to the subscribers of `topic`, in subscription order.
    /// Returns how many ran.
    pub fn publish(&self, topic: &str, event: &E) -> usize {
        let snapshot: Vec<Arc<Entry<E>>> = match self.lock().get(topic) {
            Some(entries) => entries.values().cloned().collect(),
            None => return 0,
        };

        snapshot.iter().filter(|entry| entry.deliver(event)).count()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map_or(0, BTreeMap::len)
    }

    /// Drop every subscriber entry. Used on server shutdown.
    pub fn clear(&self) {
        let drained: Vec<Arc<Entry<E>>> = {
            let mut topics = self.lock();
            topics.drain().flat_map(|(_, entries)| entries.into_values()).collect()
        };
        for entry in &drained {
            entry.deactivate();
        }
        if !drained.is_empty() {
            debug!("Cleared {} subscriber entries", drained.len());
        }
    }

    fn insert(&self, topic: &str, callback: Callback<E>, filter: Option<Filter<E>>) -> SubscriptionKey {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(topic.to_string())
            .or_default()
            .insert(id, Arc::new(Entry::new(callback, filter)));
        debug!("Subscribed {} to topic {}", id, topic);

        SubscriptionKey {
            topic: topic.to_string(),
            id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Topics<E>> {
        // A panicking subscriber must not take the registry down with it.
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(registry: &EventRegistry<u32>, topic: &str) -> (SubscriptionKey, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let key = registry.subscribe(topic, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (key, count)
    }

    #[test]
    fn test_publish_reaches_every_subscriber_of_topic() {
        let registry = EventRegistry::new();
        let (_, a) = counter(&registry, "todos");
        let (_, b) = counter(&registry, "todos");
        let (_, other) = counter(&registry, "greetings");

        assert_eq!(registry.publish("todos", &1), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_filter_selects_matching_events() {
        let registry = EventRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.subscribe_filtered("numbers", |n: &u32| n % 2 == 0, move |n| {
            sink.lock().unwrap().push(*n);
        });

        for n in 0..6 {
            registry.publish("numbers", &n);
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 2, 4]);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = EventRegistry::new();
        let (key, count) = counter(&registry, "todos");

        assert!(registry.unsubscribe(&key));
        assert!(!registry.unsubscribe(&key));
        assert_eq!(registry.subscriber_count("todos"), 0);

        assert_eq!(registry.publish("todos", &7), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear_drops_all_topics() {
        let registry = EventRegistry::new();
        counter(&registry, "a");
        counter(&registry, "b");

        registry.clear();
        assert_eq!(registry.subscriber_count("a"), 0);
        assert_eq!(registry.subscriber_count("b"), 0);
    }

    #[test]
    fn test_concurrent_publish_and_unsubscribe() {
        let registry = Arc::new(EventRegistry::new());
        let keys: Vec<_> = (0..64).map(|_| counter(&registry, "load")).collect();

        let publisher = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for n in 0..500 {
                    registry.publish("load", &n);
                }
            })
        };

        let mut after_removal = Vec::new();
        for (key, count) in &keys {
            assert!(registry.unsubscribe(key));
            after_removal.push((Arc::clone(count), count.load(Ordering::SeqCst)));
        }
        publisher.join().unwrap();

        // Nothing runs once its entry is gone
        for (count, snapshot) in after_removal {
            assert_eq!(count.load(Ordering::SeqCst), snapshot);
        }
        assert_eq!(registry.subscriber_count("load"), 0);
    }

    #[test]
    fn test_callback_can_unsubscribe_itself() {
        let registry = Arc::new(EventRegistry::new());
        let key_slot: Arc<Mutex<Option<SubscriptionKey>>> = Arc::new(Mutex::new(None));
        let count = Arc::new(AtomicUsize::new(0));

        let key = {
            let registry_ref = Arc::downgrade(&registry);
            let slot = Arc::clone(&key_slot);
            let seen = Arc::clone(&count);
            registry.subscribe("once", move |_: &u32| {
                seen.fetch_add(1, Ordering::SeqCst);
                let key = slot.lock().unwrap().take();
                if let (Some(registry), Some(key)) = (registry_ref.upgrade(), key) {
                    assert!(registry.unsubscribe(&key));
                }
            })
        };
        *key_slot.lock().unwrap() = Some(key);
        let (_, other) = counter(&registry, "once");

        assert_eq!(registry.publish("once", &1), 2);
        assert_eq!(registry.publish("once", &2), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 2);
        assert_eq!(registry.subscriber_count("once"), 1);
    }

    #[test]
    fn test_callback_can_publish_to_other_topic() {
        let registry = Arc::new(EventRegistry::new());
        let (_, relayed) = counter(&registry, "relay");
        {
            let registry_ref = Arc::downgrade(&registry);
            registry.subscribe("source", move |n: &u32| {
                if let Some(registry) = registry_ref.upgrade() {
                    registry.publish("relay", n);
                }
            });
        }

        assert_eq!(registry.publish("source", &5), 1);
        assert_eq!(relayed.load(Ordering::SeqCst), 1);
    }
}
