//! Error types shared by the device kernel.
//!
//! Each seam gets its own enum so callers can tell a transient bus hiccup from a
//! resource conflict without string matching. Command handlers and the binaries
//! work with `anyhow` on top of these.

use std::path::PathBuf;

/// Failures of the liveness channel (pub/sub transport)
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus session closed")]
    Closed,
    #[error("loopback transport refused non-local host: {0}")]
    NonLoopback(String),
    #[error("MQTT request queue is full, broker unreachable?")]
    Backlog,
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),
}

/// Failures of a single worker. Only lethal workers let these cross into
/// a device shutdown; everything else ends up in the worker's health.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("resource conflict on {path:?}: {reason}")]
    ResourceConflict { path: PathBuf, reason: String },
    #[error("dependency {0:?} never appeared")]
    DependencyMissing(PathBuf),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process exited unexpectedly: {0}")]
    Exited(String),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("{0}")]
    Failed(String),
}

/// Failures of the durable identity/config store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures while building or driving a device
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("worker already registered: {0}")]
    DuplicateWorker(String),
    #[error("device is {0}, operation not allowed")]
    InvalidState(&'static str),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}
