//! Broadcast event bus
//!
//! Lifecycle notifications are published on a broadcast channel. Publishing
//! never blocks and never fails: with no subscribers the event is dropped,
//! and a slow subscriber only lags itself. Emitters therefore cannot be
//! aborted by whoever listens to them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Events carry a stable name used for counters and log fields
pub trait NamedEvent {
    fn name(&self) -> &'static str;
}

/// Broadcast bus for one family of events
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
    counts: Mutex<HashMap<&'static str, u64>>,
    last_published_at: Mutex<Option<DateTime<Utc>>>,
}

impl<E: Clone + NamedEvent> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            counts: Mutex::new(HashMap::new()),
            last_published_at: Mutex::new(None),
        }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: E) {
        *self.counts.lock().entry(event.name()).or_insert(0) += 1;
        *self.last_published_at.lock() = Some(Utc::now());

        // No receivers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Number of events published under `name`
    pub fn count(&self, name: &str) -> u64 {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> EventBusStats {
        let events_by_type: HashMap<String, u64> = self
            .counts
            .lock()
            .iter()
            .map(|(name, count)| (name.to_string(), *count))
            .collect();
        EventBusStats {
            total_events: events_by_type.values().sum(),
            subscriber_count: self.sender.receiver_count(),
            events_by_type,
            last_published_at: *self.last_published_at.lock(),
        }
    }
}

impl<E: Clone + NamedEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Event bus statistics
#[derive(Clone, Debug)]
pub struct EventBusStats {
    pub total_events: u64,
    pub subscriber_count: usize,
    pub events_by_type: HashMap<String, u64>,
    pub last_published_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum Ping {
        A,
        B,
    }

    impl NamedEvent for Ping {
        fn name(&self) -> &'static str {
            match self {
                Ping::A => "a",
                Ping::B => "b",
            }
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(Ping::A);
        assert_eq!(bus.count("a"), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(Ping::A);
        bus.publish(Ping::B);

        assert_eq!(rx.recv().await.unwrap(), Ping::A);
        assert_eq!(rx.recv().await.unwrap(), Ping::B);

        let stats = bus.stats();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.events_by_type.get("b"), Some(&1));
        assert!(stats.last_published_at.is_some());
    }
}
