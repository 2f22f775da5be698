//! Device identity and its durable JSON store (`device.cfg`).
//!
//! The store is a flat JSON object shared with other tools on the device, so
//! every write is read-modify-write: keys we do not own survive untouched.
//! A missing or corrupt file reads as empty and never stops the device.

use crate::error::StoreError;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

pub const UNKNOWN_NAME: &str = "unknown";
pub const UNKNOWN_IP: &str = "0.0.0.0";

const DEVICE_ID_KEY: &str = "device_id";
const DEVICE_NAME_KEY: &str = "device_name";

/// Result of a rename request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameChange {
    Unchanged,
    Renamed { old: String, new: String },
}

pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the persisted device id, generating and persisting one on first boot
    pub fn ensure_device_id(&self) -> Result<String, StoreError> {
        let _guard = self.lock.lock();
        let mut data = self.read_map();
        if let Some(Value::String(id)) = data.get(DEVICE_ID_KEY) {
            if !id.is_empty() {
                return Ok(id.clone());
            }
        }

        let id = generate_device_id();
        data.insert(DEVICE_ID_KEY.into(), Value::String(id.clone()));
        self.write_map(&data)?;
        info!("[identity] generated device id {}", id);
        Ok(id)
    }

    /// Stored display name, or `"unknown"` when missing or unreadable
    pub fn name(&self) -> String {
        let _guard = self.lock.lock();
        match self.read_map().get(DEVICE_NAME_KEY) {
            Some(Value::String(name)) => name.clone(),
            Some(other) => other.to_string(),
            None => UNKNOWN_NAME.to_string(),
        }
    }

    /// Persists a new name. Writing the current value is a no-op.
    pub fn set_name(&self, name: &str) -> Result<NameChange, StoreError> {
        let _guard = self.lock.lock();
        let mut data = self.read_map();
        let old = match data.get(DEVICE_NAME_KEY) {
            Some(Value::String(current)) if current == name => return Ok(NameChange::Unchanged),
            Some(Value::String(current)) => current.clone(),
            _ => UNKNOWN_NAME.to_string(),
        };

        data.insert(DEVICE_NAME_KEY.into(), Value::String(name.to_string()));
        self.write_map(&data)?;
        Ok(NameChange::Renamed {
            old,
            new: name.to_string(),
        })
    }

    /// Raw value of any key, for keys owned by other tools
    pub fn get(&self, key: &str) -> Option<Value> {
        let _guard = self.lock.lock();
        self.read_map().get(key).cloned()
    }

    fn read_map(&self) -> Map<String, Value> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                warn!("[identity] failed to read {:?}: {}", self.path, e);
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!("[identity] {:?} is not a JSON object, using defaults", self.path);
                Map::new()
            }
            Err(e) => {
                warn!("[identity] corrupt {:?}: {}, using defaults", self.path, e);
                Map::new()
            }
        }
    }

    fn write_map(&self, data: &Map<String, Value>) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(data)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        // write-then-rename so a crash never leaves a half-written store
        let tmp = self.path.with_extension("cfg.tmp");
        std::fs::write(&tmp, content).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn generate_device_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("dev-{}", &hex[..6])
}

/// Immutable-after-boot identity of a device
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub group_id: String,
    pub ip: String,
    pub boot_time: OffsetDateTime,
    booted: Instant,
}

impl DeviceIdentity {
    pub fn new(device_id: String, group_id: String, ip: String) -> Self {
        Self {
            device_id,
            group_id,
            ip,
            boot_time: OffsetDateTime::now_utc(),
            booted: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.booted.elapsed()
    }
}

/// Best-effort address of the outbound interface
pub fn probe_ip() -> String {
    match local_ip_address::local_ip() {
        Ok(ip) => {
            info!("[identity] IP self-check: {}", ip);
            ip.to_string()
        }
        Err(e) => {
            warn!("[identity] IP self-check failed: {}", e);
            UNKNOWN_IP.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> ConfigStore {
        ConfigStore::open(dir.path().join("device.cfg"))
    }

    #[test]
    fn test_missing_store_reads_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.name(), UNKNOWN_NAME);
        assert!(store.get("device_id").is_none());
    }

    #[test]
    fn test_device_id_is_generated_once() {
        let dir = TempDir::new().unwrap();
        let first = store_in(&dir).ensure_device_id().unwrap();
        assert!(first.starts_with("dev-"));
        assert_eq!(first.len(), 10);

        let again = store_in(&dir).ensure_device_id().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_rename_preserves_unrelated_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.cfg");
        std::fs::write(&path, r#"{"device_id":"dev-abcdef","wifi":"barn"}"#).unwrap();

        let store = ConfigStore::open(&path);
        let change = store.set_name("north-cam").unwrap();
        assert_eq!(
            change,
            NameChange::Renamed { old: UNKNOWN_NAME.into(), new: "north-cam".into() }
        );

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["device_id"], "dev-abcdef");
        assert_eq!(on_disk["device_name"], "north-cam");
        assert_eq!(on_disk["wifi"], "barn");
    }

    #[test]
    fn test_same_name_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.set_name("north-cam").unwrap();
        let before = std::fs::metadata(store.path()).unwrap().modified().unwrap();

        assert_eq!(store.set_name("north-cam").unwrap(), NameChange::Unchanged);
        let after = std::fs::metadata(store.path()).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_corrupt_store_is_treated_as_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("device.cfg");
        std::fs::write(&path, "{not json").unwrap();

        let store = ConfigStore::open(&path);
        assert_eq!(store.name(), UNKNOWN_NAME);
        let id = store.ensure_device_id().unwrap();
        assert_eq!(store.get("device_id"), Some(Value::String(id)));
    }
}
