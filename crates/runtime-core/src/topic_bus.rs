//! Topic Bus (C2).
//!
//! In-process publish/subscribe keyed by topic string. Grounded on the
//! timing system's `EventBus` (per-stream `broadcast` channels): here each
//! subscriber gets its own bounded queue instead of sharing a broadcast
//! channel, so that one slow subscriber can be dropped without affecting
//! the others' lag counters.

use bus_protocol::EventEnvelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Handle returned by `subscribe`. Invalidated (silently) once the
/// subscriber's queue overflows or the receiver is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscriber {
    topic: String,
    tx: mpsc::Sender<EventEnvelope>,
}

/// The in-process publish/subscribe bus.
///
/// Cloning shares the underlying registry (cheap, `Arc`-backed) the way the
/// timing system's `EventBus`/`StreamCounts` handles are shared across
/// tasks.
#[derive(Clone)]
pub struct TopicBus {
    inner: Arc<RwLock<HashMap<u64, Subscriber>>>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl TopicBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Subscribe to `topic`, returning a handle and the receiving half of a
    /// bounded queue. FIFO delivery per (topic, subscriber) is guaranteed by
    /// the underlying `mpsc` channel.
    pub fn subscribe(&self, topic: impl Into<String>) -> (SubscriptionHandle, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.write().unwrap().insert(id, Subscriber { topic: topic.into(), tx });
        (SubscriptionHandle(id), rx)
    }

    /// Remove a subscription. A no-op if already dropped (e.g. by overflow).
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.inner.write().unwrap().remove(&handle.0);
    }

    /// Publish never blocks on subscriber liveness. A subscriber whose queue
    /// is full is dropped and must resubscribe; other subscribers and the
    /// publisher are unaffected.
    pub fn publish(&self, topic: &str, payload: EventEnvelope) {
        let mut dead = Vec::new();
        {
            let inner = self.inner.read().unwrap();
            for (id, sub) in inner.iter() {
                if sub.topic != topic {
                    continue;
                }
                match sub.tx.try_send(payload.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(topic, "subscriber queue overflowed, dropping subscriber");
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.write().unwrap();
            for id in dead {
                inner.remove(&id);
            }
        }
    }

    /// Number of live subscribers on a topic (test/observability helper).
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.read().unwrap().values().filter(|s| s.topic == topic).count()
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(event_type: &str) -> EventEnvelope {
        EventEnvelope::new("test", event_type, json!({}))
    }

    #[tokio::test]
    async fn publish_and_receive_single_event() {
        let bus = TopicBus::new();
        let (_h, mut rx) = bus.subscribe("dashboard");
        bus.publish("dashboard", env("a"));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.event_type, "a");
    }

    #[tokio::test]
    async fn delivery_is_fifo_per_subscriber() {
        let bus = TopicBus::new();
        let (_h, mut rx) = bus.subscribe("t");
        bus.publish("t", env("1"));
        bus.publish("t", env("2"));
        bus.publish("t", env("3"));
        assert_eq!(rx.try_recv().unwrap().event_type, "1");
        assert_eq!(rx.try_recv().unwrap().event_type, "2");
        assert_eq!(rx.try_recv().unwrap().event_type, "3");
    }

    #[tokio::test]
    async fn different_topics_are_isolated() {
        let bus = TopicBus::new();
        let (_h1, mut r1) = bus.subscribe("a");
        let (_h2, mut r2) = bus.subscribe("b");
        bus.publish("a", env("x"));
        assert!(r1.try_recv().is_ok());
        assert!(r2.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_block_or_panic() {
        let bus = TopicBus::new();
        bus.publish("nobody-listening", env("x"));
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_dropped_others_unaffected() {
        let bus = TopicBus::with_capacity(2);
        let (_h_slow, slow_rx) = bus.subscribe("t");
        let (_h_fast, mut fast_rx) = bus.subscribe("t");
        // Fill the slow subscriber's queue past capacity without draining it.
        for i in 0..5 {
            bus.publish("t", env(&i.to_string()));
        }
        assert_eq!(bus.subscriber_count("t"), 1, "slow subscriber should have been dropped");
        // The fast subscriber (drained promptly) still gets everything published
        // before it, modulo the ones lost once the slow one got pruned from the loop.
        assert!(fast_rx.try_recv().is_ok());
        drop(slow_rx);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handle() {
        let bus = TopicBus::new();
        let (handle, _rx) = bus.subscribe("t");
        assert_eq!(bus.subscriber_count("t"), 1);
        bus.unsubscribe(handle);
        assert_eq!(bus.subscriber_count("t"), 0);
    }
}
