//! MQTT transport for the liveness channel.
//!
//! One background task polls the rumqttc event loop and fans incoming publishes
//! out to local subscriptions. Connection errors are logged and retried after a
//! short pause, never propagated: a device without a broker keeps running and
//! the fleet simply stops seeing its heartbeat.

use super::{Bus, BusFuture, Message, SubscriberSet, Subscription};
use crate::error::BusError;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ClientError, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const LOOPBACK_HOST: &str = "127.0.0.1";
const REQUEST_QUEUE: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keep_alive_secs: 15,
        }
    }
}

/// Reach of a transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportScope {
    /// Regular broker session visible to the whole fleet
    Fleet,
    /// Local-only session: broker must live on this host, nothing remote is contacted
    Loopback,
}

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    shared: Arc<Shared>,
}

struct Shared {
    subscribers: SubscriberSet,
    filters: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MqttBus {
    /// Opens a session. Must be called from inside a tokio runtime.
    pub fn connect(client_id: &str, settings: &MqttSettings, scope: TransportScope) -> Result<Self, BusError> {
        let host = match scope {
            TransportScope::Fleet => settings.host.clone(),
            TransportScope::Loopback => {
                if !is_loopback_host(&settings.host) {
                    return Err(BusError::NonLoopback(settings.host.clone()));
                }
                LOOPBACK_HOST.to_string()
            }
        };

        let mut opts = MqttOptions::new(client_id, &host, settings.port);
        opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        opts.set_clean_session(true);
        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_QUEUE);

        let shared = Arc::new(Shared {
            subscribers: SubscriberSet::default(),
            filters: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        info!("[bus] MQTT session {} -> {}:{} ({:?})", client_id, host, settings.port, scope);

        let loop_shared = shared.clone();
        let loop_client = client.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        let msg = Message {
                            topic: p.topic.clone(),
                            payload: p.payload.to_vec(),
                        };
                        loop_shared.subscribers.dispatch(&msg);
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        // clean sessions drop subscriptions on reconnect
                        let filters = loop_shared.filters.lock().clone();
                        for filter in filters {
                            if let Err(e) = loop_client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                                warn!("[bus] resubscribe to {} failed: {}", filter, e);
                            }
                        }
                        debug!("[bus] connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if loop_shared.closed.load(Ordering::SeqCst) {
                            debug!("[bus] event loop finished");
                            break;
                        }
                        error!("[bus] MQTT connection error: {}", e);
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        });

        Ok(Self { client, shared })
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Bus for MqttBus {
    /// Never waits on the event loop: while the broker is away the request
    /// queue fills up and further publishes fail with [`BusError::Backlog`].
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BusFuture<'a, ()> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(BusError::Closed);
            }
            // rumqttc reports a wildcard topic the same way as a full queue
            if topic.contains(['+', '#']) {
                return Err(BusError::InvalidFilter(topic.to_string()));
            }
            match self.client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
                Ok(()) => Ok(()),
                Err(ClientError::TryRequest(_)) => Err(BusError::Backlog),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn subscribe<'a>(&'a self, filters: &'a [String]) -> BusFuture<'a, Subscription> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(BusError::Closed);
            }
            let subscription = self.shared.subscribers.add(filters)?;
            for filter in filters {
                self.client.subscribe(filter.as_str(), QoS::AtLeastOnce).await?;
                {
                    let mut known = self.shared.filters.lock();
                    if !known.contains(filter) {
                        known.push(filter.clone());
                    }
                }
            }
            Ok(subscription)
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.shared.subscribers.clear();
            // a full queue means no session to say goodbye to
            if let Err(e) = self.client.try_disconnect() {
                debug!("[mqtt] disconnect not queued: {}", e);
            }
            Ok(())
        })
    }
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}
