//! Liveness channel: the pub/sub contract used for heartbeats, commands and ACKs.
//!
//! The kernel only depends on the [`Bus`] trait. Two transports implement it:
//! - [`MqttBus`] talks to an MQTT broker (fleet-wide or loopback-only scope)
//! - [`MemoryBus`] is an in-process broker for DEBUG deployments and tests
//!
//! Topic filters follow MQTT rules: `+` matches one level, `#` the remaining tail.

mod memory;
mod mqtt;

pub use memory::MemoryBus;
pub use mqtt::{MqttBus, MqttSettings, TransportScope};

use crate::error::BusError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type BusFuture<'a, T> = BoxFuture<'a, Result<T, BusError>>;

/// Shared handle on a transport
pub type SharedBus = Arc<dyn Bus>;

/// One message as seen by a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Publish/subscribe transport
pub trait Bus: Send + Sync + 'static {
    /// Publishes `payload` on `topic`. Failures are transient from the caller's
    /// point of view: log them and carry on.
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BusFuture<'a, ()>;

    /// Opens a subscription receiving every message matching one of `filters`
    fn subscribe<'a>(&'a self, filters: &'a [String]) -> BusFuture<'a, Subscription>;

    /// Closes the session. Later publishes fail with [`BusError::Closed`].
    fn close(&self) -> BusFuture<'_, ()>;
}

/// Receiving end of a subscription
pub struct Subscription {
    filters: Vec<String>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Next matching message, `None` once the transport is closed
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out table shared by both transports
#[derive(Default)]
pub(crate) struct SubscriberSet {
    entries: Mutex<Vec<(Vec<String>, mpsc::UnboundedSender<Message>)>>,
}

impl SubscriberSet {
    pub(crate) fn add(&self, filters: &[String]) -> Result<Subscription, BusError> {
        for filter in filters {
            validate_filter(filter)?;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries.lock().push((filters.to_vec(), tx));
        Ok(Subscription {
            filters: filters.to_vec(),
            rx,
        })
    }

    /// Delivers `msg` to every live subscriber with a matching filter and
    /// prunes subscribers whose receiver was dropped.
    pub(crate) fn dispatch(&self, msg: &Message) -> usize {
        let mut delivered = 0;
        self.entries.lock().retain(|(filters, tx)| {
            if tx.is_closed() {
                return false;
            }
            if filters.iter().any(|f| topic_matches(f, &msg.topic)) && tx.send(msg.clone()).is_ok() {
                delivered += 1;
            }
            true
        });
        delivered
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().iter().filter(|(_, tx)| !tx.is_closed()).count()
    }
}

/// MQTT-style topic matching
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

fn validate_filter(filter: &str) -> Result<(), BusError> {
    if filter.is_empty() {
        return Err(BusError::InvalidFilter(filter.to_string()));
    }
    let parts: Vec<&str> = filter.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        let has_wildcard = part.contains('#') || part.contains('+');
        if has_wildcard && part.len() > 1 {
            return Err(BusError::InvalidFilter(filter.to_string()));
        }
        if *part == "#" && i != parts.len() - 1 {
            return Err(BusError::InvalidFilter(filter.to_string()));
        }
    }
    Ok(())
}
