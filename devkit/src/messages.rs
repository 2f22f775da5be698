/*!
Payload builders for the liveness channel
*/

use herd_device::protocol::{unix_now, CommandEnvelope, HeartbeatRecord};
use serde_json::Value;

pub struct MessageBuilder;

impl MessageBuilder {
    /// JSON heartbeat stamped now
    pub fn heartbeat(device_id: &str, name: &str, ip: &str) -> Vec<u8> {
        HeartbeatRecord {
            timestamp: unix_now(),
            device_id: device_id.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
        }
        .to_payload()
    }

    /// `timestamp, device_id, name, ip` line sent by older devices
    pub fn legacy_heartbeat(device_id: &str, name: &str, ip: &str) -> Vec<u8> {
        format!("{}, {}, {}, {}", unix_now(), device_id, name, ip).into_bytes()
    }

    pub fn command(verb: &str, property: Option<Value>) -> Vec<u8> {
        CommandEnvelope::new(verb, property).to_payload()
    }
}
