/*!
Test harness for device and console tests

Owns a temporary directory (identity store, recordings) and an in-memory bus,
and hands out device builders tuned for fast tests.
*/

use crate::messages::MessageBuilder;
use herd_device::bus::{Bus, MemoryBus, SharedBus};
use herd_device::device::{DeviceBuilder, Timing};
use herd_device::protocol::{ack_topic, command_topic};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_GROUP: &str = "fleet1";
pub const TEST_IP: &str = "10.0.0.7";

pub struct TestHarness {
    pub dir: TempDir,
    pub bus: MemoryBus,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().expect("temp dir for test harness"),
            bus: MemoryBus::recording(),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.path().join("device.cfg")
    }

    pub fn shared_bus(&self) -> SharedBus {
        Arc::new(self.bus.clone())
    }

    /// Writes the identity store before the device is built
    pub fn seed_store(&self, content: Value) {
        std::fs::write(self.store_path(), content.to_string()).expect("seed device.cfg");
    }

    /// Raw JSON currently in the identity store
    pub fn read_store(&self) -> Value {
        let text = std::fs::read_to_string(self.store_path()).unwrap_or_default();
        serde_json::from_str(&text).unwrap_or(Value::Null)
    }

    /// Builder on the harness bus and store with short timings
    pub fn builder(&self) -> DeviceBuilder {
        DeviceBuilder::new(self.shared_bus())
            .store_path(self.store_path())
            .group_id(TEST_GROUP)
            .ip(TEST_IP)
            .heartbeat_interval(Duration::from_millis(50))
            .timing(Timing {
                start_stagger: Duration::from_millis(5),
                dispatch_idle: Duration::from_millis(10),
                stop_settle: Duration::from_millis(10),
            })
    }

    /// Publishes a command envelope on `{scope}/COMMAND`
    pub async fn send_command(&self, scope: &str, verb: &str, property: Option<Value>) {
        self.bus
            .publish(&command_topic(scope), MessageBuilder::command(verb, property))
            .await
            .expect("publish on harness bus");
    }

    /// Waits until at least `count` subscriptions exist on the harness bus
    pub async fn wait_for_subscribers(&self, count: usize) -> bool {
        let bus = self.bus.clone();
        wait_until(Duration::from_secs(2), move || bus.subscriber_count() >= count).await
    }

    pub fn acks(&self, scope: &str) -> usize {
        self.bus.published_on(&ack_topic(scope)).len()
    }
}

/// Polls `condition` every 10 ms until it holds or `timeout` expires
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Routes `tracing` output to the test writer; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}
