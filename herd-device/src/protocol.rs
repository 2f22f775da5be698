//! Wire formats and topic names of the liveness channel.
//!
//! | Topic                          | Payload                                  |
//! |--------------------------------|------------------------------------------|
//! | `global/IFF`                   | [`HeartbeatRecord`] as JSON              |
//! | `local/health`                 | [`HealthReport`] as JSON (loopback only) |
//! | `{scope}/COMMAND`              | [`CommandEnvelope`] as JSON              |
//! | `{scope}/ACK`                  | literal `ACK`                            |
//!
//! `scope` is `global`, a group id or a device id.

use crate::device::DeviceState;
use crate::worker::Health;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

pub const IFF_TOPIC: &str = "global/IFF";
pub const LOCAL_HEALTH_TOPIC: &str = "local/health";
pub const GLOBAL_SCOPE: &str = "global";
pub const ACK_PAYLOAD: &str = "ACK";

const COMMAND_SUFFIX: &str = "/COMMAND";
const ACK_SUFFIX: &str = "/ACK";

pub fn command_topic(scope: &str) -> String {
    format!("{scope}{COMMAND_SUFFIX}")
}

pub fn ack_topic(scope: &str) -> String {
    format!("{scope}{ACK_SUFFIX}")
}

/// Maps `x/COMMAND` to its acknowledgement topic `x/ACK`
pub fn ack_topic_for(command_topic: &str) -> Option<String> {
    command_topic.strip_suffix(COMMAND_SUFFIX).map(ack_topic)
}

/// Seconds since the unix epoch, sub-second precision
pub fn unix_now() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not UTF-8")]
    Utf8,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed heartbeat: {0}")]
    Malformed(String),
}

/// Identity + liveness announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub timestamp: f64,
    pub device_id: String,
    pub name: String,
    pub ip: String,
}

impl HeartbeatRecord {
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decodes the JSON form, falling back to the legacy
    /// `timestamp, device_id, name, ip` line older devices still send.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload).map_err(|_| DecodeError::Utf8)?.trim();
        if text.starts_with('{') {
            return Ok(serde_json::from_str(text)?);
        }

        let fields: Vec<&str> = text.split(',').map(str::trim).collect();
        let [timestamp, device_id, name, ip] = fields.as_slice() else {
            return Err(DecodeError::Malformed(format!("expected 4 fields, got {}", fields.len())));
        };
        let timestamp = timestamp
            .parse::<f64>()
            .map_err(|_| DecodeError::Malformed(format!("bad timestamp {timestamp:?}")))?;
        if device_id.is_empty() {
            return Err(DecodeError::Malformed("empty device id".into()));
        }
        Ok(Self {
            timestamp,
            device_id: device_id.to_string(),
            name: name.to_string(),
            ip: ip.to_string(),
        })
    }
}

/// Richer record published on the loopback-only health topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(flatten)]
    pub record: HeartbeatRecord,
    pub state: DeviceState,
    pub uptime_secs: u64,
    pub workers: BTreeMap<String, Health>,
}

/// Remote command as carried on `{scope}/COMMAND`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command: String,
    #[serde(default)]
    pub property: Option<Value>,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>, property: Option<Value>) -> Self {
        Self {
            command: command.into(),
            property,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
