//! In-process broker.
//!
//! Same filter semantics as the MQTT transport, no network. A bus built with
//! [`MemoryBus::recording`] also keeps every published message so tests can
//! inspect traffic; [`MemoryBus::new`] keeps nothing.

use super::{Bus, BusFuture, Message, SubscriberSet, Subscription};
use crate::error::BusError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: SubscriberSet,
    record: bool,
    published: Mutex<Vec<Message>>,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that keeps a copy of everything published on it
    pub fn recording() -> Self {
        Self {
            inner: Arc::new(Inner {
                record: true,
                ..Inner::default()
            }),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.inner.record
    }

    /// Every message published so far, oldest first. Empty unless recording.
    pub fn published(&self) -> Vec<Message> {
        self.inner.published.lock().clone()
    }

    /// Messages published on exactly `topic`
    pub fn published_on(&self, topic: &str) -> Vec<Message> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.inner.published.lock().clear();
    }

    fn deliver(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let msg = Message {
            topic: topic.to_string(),
            payload,
        };
        let delivered = self.inner.subscribers.dispatch(&msg);
        debug!("[memory-bus] {} -> {} subscriber(s)", msg.topic, delivered);
        if self.inner.record {
            self.inner.published.lock().push(msg);
        }
        Ok(())
    }
}

impl Bus for MemoryBus {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BusFuture<'a, ()> {
        Box::pin(async move { self.deliver(topic, payload) })
    }

    fn subscribe<'a>(&'a self, filters: &'a [String]) -> BusFuture<'a, Subscription> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(BusError::Closed);
            }
            self.inner.subscribers.add(filters)
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            self.inner.closed.store(true, Ordering::SeqCst);
            self.inner.subscribers.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_matching_subscribers() {
        let bus = MemoryBus::recording();
        let mut sub = bus.subscribe(&["+/COMMAND".to_string()]).await.unwrap();

        bus.publish("fleet1/COMMAND", b"{}".to_vec()).await.unwrap();
        bus.publish("global/IFF", b"hb".to_vec()).await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.topic, "fleet1/COMMAND");
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.published().len(), 2);
        assert_eq!(bus.published_on("global/IFF").len(), 1);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_publish() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&["#".to_string()]).await.unwrap();
        bus.close().await.unwrap();

        assert!(matches!(bus.publish("a", vec![]).await, Err(BusError::Closed)));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_plain_bus_keeps_no_history() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe(&["#".to_string()]).await.unwrap();
        for _ in 0..1000 {
            bus.publish("global/IFF", b"hb".to_vec()).await.unwrap();
        }

        assert!(!bus.is_recording());
        assert!(bus.published().is_empty());
        assert_eq!(sub.try_recv().unwrap().topic, "global/IFF");
    }
}
