//! YAML configuration of a device (`herd.yaml`).
//!
//! Every field has a default, so a partial file only overrides what it names.
//! A missing or unparsable file is logged and replaced by the defaults.

use crate::bus::MqttSettings;
use crate::device::Timing;
use crate::profiles::CameraSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "HERD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "herd.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HerdConfig {
    pub group_id: String,
    pub store_path: PathBuf,
    pub log_path: PathBuf,
    pub mqtt: MqttSettings,
    pub heartbeat: HeartbeatConf,
    pub timing: TimingConf,
    pub status_api: Option<StatusApiConf>,
    pub camera: CameraSettings,
}

impl Default for HerdConfig {
    fn default() -> Self {
        Self {
            group_id: "herd".into(),
            store_path: PathBuf::from("device.cfg"),
            log_path: PathBuf::from("logs.txt"),
            mqtt: MqttSettings::default(),
            heartbeat: HeartbeatConf::default(),
            timing: TimingConf::default(),
            status_api: None,
            camera: CameraSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConf {
    pub interval_ms: u64,
}

impl Default for HeartbeatConf {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl HeartbeatConf {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConf {
    pub start_stagger_ms: u64,
    pub dispatch_idle_ms: u64,
    pub stop_settle_ms: u64,
}

impl Default for TimingConf {
    fn default() -> Self {
        Self {
            start_stagger_ms: 100,
            dispatch_idle_ms: 100,
            stop_settle_ms: 500,
        }
    }
}

impl From<&TimingConf> for Timing {
    fn from(conf: &TimingConf) -> Self {
        Timing {
            start_stagger: Duration::from_millis(conf.start_stagger_ms),
            dispatch_idle: Duration::from_millis(conf.dispatch_idle_ms.max(1)),
            stop_settle: Duration::from_millis(conf.stop_settle_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusApiConf {
    pub bind: SocketAddr,
}

/// Config path: explicit argument, else `$HERD_CONFIG`, else `herd.yaml`
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
    }
}

pub fn load_config(path: &Path) -> HerdConfig {
    if !path.exists() {
        info!("[config] no {}, using defaults", path.display());
        return HerdConfig::default();
    }
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("[config] cannot read {}: {}, using defaults", path.display(), e);
            return HerdConfig::default();
        }
    };
    if text.trim().is_empty() {
        return HerdConfig::default();
    }
    serde_yaml::from_str(&text).unwrap_or_else(|e| {
        warn!("[config] invalid {}: {}, using defaults", path.display(), e);
        HerdConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("herd.yaml");
        std::fs::write(
            &path,
            "group_id: fleet1\nmqtt:\n  host: broker.lan\ncamera:\n  overwrite_shm: false\n",
        )
        .unwrap();

        let cfg = load_config(&path);
        assert_eq!(cfg.group_id, "fleet1");
        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.port, 1883);
        assert!(!cfg.camera.overwrite_shm);
        assert_eq!(cfg.camera.shm_base, "/tmp/pi_cam_shm_");
        assert_eq!(cfg.heartbeat.interval(), Duration::from_secs(1));
        assert!(cfg.status_api.is_none());
    }

    #[test]
    fn test_invalid_or_missing_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let missing = load_config(&dir.path().join("nope.yaml"));
        assert_eq!(missing.group_id, "herd");

        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "group_id: [unterminated").unwrap();
        let bad = load_config(&path);
        assert_eq!(bad.store_path, PathBuf::from("device.cfg"));
    }

    #[test]
    fn test_status_api_bind_parses() {
        let cfg: HerdConfig = serde_yaml::from_str("status_api:\n  bind: 127.0.0.1:8080\n").unwrap();
        assert_eq!(cfg.status_api.unwrap().bind.port(), 8080);
    }

    #[test]
    fn test_timing_conversion() {
        let timing = Timing::from(&TimingConf::default());
        assert_eq!(timing, Timing::default());
    }
}
