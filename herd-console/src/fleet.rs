//! Fleet table fed by heartbeats.
//!
//! Every heartbeat refreshes its device's TTL to the configured maximum and
//! marks it online. A ticker takes one unit off every TTL per period; an entry
//! reaching zero goes offline but is never removed.

use herd_device::bus::SharedBus;
use herd_device::protocol::{HeartbeatRecord, IFF_TOPIC};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_TTL: u64 = 10;
pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEntry {
    pub device_id: String,
    pub name: String,
    pub ip: String,
    pub ttl_remaining: u64,
    pub online: bool,
    /// Sender timestamp of the last heartbeat (unix seconds)
    pub last_heartbeat: f64,
}

#[derive(Debug, Clone)]
pub struct FleetTable {
    max_ttl: u64,
    entries: BTreeMap<String, FleetEntry>,
}

impl FleetTable {
    pub fn new(max_ttl: u64) -> Self {
        Self {
            max_ttl: max_ttl.max(1),
            entries: BTreeMap::new(),
        }
    }

    pub fn max_ttl(&self) -> u64 {
        self.max_ttl
    }

    /// Upserts the sender of `record`. Returns `true` if the device is new or
    /// came back online.
    pub fn observe(&mut self, record: HeartbeatRecord) -> bool {
        let max_ttl = self.max_ttl;
        match self.entries.get_mut(&record.device_id) {
            Some(entry) => {
                let recovered = !entry.online;
                entry.name = record.name;
                entry.ip = record.ip;
                entry.ttl_remaining = max_ttl;
                entry.online = true;
                entry.last_heartbeat = record.timestamp;
                recovered
            }
            None => {
                self.entries.insert(
                    record.device_id.clone(),
                    FleetEntry {
                        device_id: record.device_id,
                        name: record.name,
                        ip: record.ip,
                        ttl_remaining: max_ttl,
                        online: true,
                        last_heartbeat: record.timestamp,
                    },
                );
                true
            }
        }
    }

    /// One ticker period. Returns the ids that just went offline.
    pub fn tick(&mut self) -> Vec<String> {
        let mut expired = Vec::new();
        for entry in self.entries.values_mut() {
            entry.ttl_remaining = entry.ttl_remaining.saturating_sub(1);
            if entry.ttl_remaining == 0 && entry.online {
                entry.online = false;
                expired.push(entry.device_id.clone());
            }
        }
        expired
    }

    pub fn get(&self, device_id: &str) -> Option<&FleetEntry> {
        self.entries.get(device_id)
    }

    /// Entries ordered by device id
    pub fn snapshot(&self) -> Vec<FleetEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.entries.values().filter(|e| e.online).count()
    }
}

/// Shared fleet table plus a watch channel carrying every new snapshot
#[derive(Clone)]
pub struct FleetAggregator {
    table: Arc<Mutex<FleetTable>>,
    updates: watch::Sender<Vec<FleetEntry>>,
    tick: Duration,
}

impl FleetAggregator {
    pub fn new(max_ttl: u64) -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            table: Arc::new(Mutex::new(FleetTable::new(max_ttl))),
            updates,
            tick: TICK,
        }
    }

    /// Ticker period (one TTL unit)
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Render sinks: receive the table after every heartbeat and every tick
    pub fn subscribe(&self) -> watch::Receiver<Vec<FleetEntry>> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> Vec<FleetEntry> {
        self.table.lock().snapshot()
    }

    pub fn get(&self, device_id: &str) -> Option<FleetEntry> {
        self.table.lock().get(device_id).cloned()
    }

    pub fn online_count(&self) -> usize {
        self.table.lock().online_count()
    }

    /// Applies one raw heartbeat payload. Undecodable payloads are dropped.
    pub fn observe_payload(&self, payload: &[u8]) {
        match HeartbeatRecord::decode(payload) {
            Ok(record) => self.observe(record),
            Err(e) => warn!("[fleet] heartbeat dropped: {}", e),
        }
    }

    pub fn observe(&self, record: HeartbeatRecord) {
        let (recovered, snapshot) = {
            let mut table = self.table.lock();
            let id = record.device_id.clone();
            let name = record.name.clone();
            let recovered = table.observe(record);
            if recovered {
                info!("[fleet] {} ({}) online", id, name);
            }
            (recovered, table.snapshot())
        };
        debug!("[fleet] heartbeat applied, recovered={}", recovered);
        self.updates.send_replace(snapshot);
    }

    pub fn tick(&self) {
        let (expired, snapshot) = {
            let mut table = self.table.lock();
            (table.tick(), table.snapshot())
        };
        for id in &expired {
            warn!("[fleet] {} offline (TTL expired)", id);
        }
        self.updates.send_replace(snapshot);
    }

    /// Consumes `global/IFF` from `bus` and ticks until `shutdown` resolves
    pub async fn run<F>(&self, bus: SharedBus, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut subscription = bus.subscribe(&[IFF_TOPIC.to_string()]).await?;
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;
        info!("[fleet] watching {} (ttl {} ticks of {:?})", IFF_TOPIC, self.table.lock().max_ttl(), self.tick);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                msg = subscription.recv() => match msg {
                    Some(msg) => self.observe_payload(&msg.payload),
                    None => {
                        warn!("[fleet] bus closed, aggregator stopping");
                        break;
                    }
                },
                _ = ticker.tick() => self.tick(),
            }
        }
        Ok(())
    }
}
