//! Local HTTP status surface.
//!
//! Read-only views of the device plus two write endpoints that only enqueue
//! into the command inbox: every state change still goes through the
//! dispatcher.

use crate::device::{DeviceHandle, DeviceState};
use crate::error::WorkerError;
use crate::worker::{Health, Worker, WorkerContext};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

pub const STATUS_API_WORKER: &str = "status_api";

pub struct StatusApi {
    bind: SocketAddr,
}

impl StatusApi {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind }
    }
}

impl Worker for StatusApi {
    fn name(&self) -> &str {
        STATUS_API_WORKER
    }

    fn run(self: Box<Self>, ctx: WorkerContext) -> BoxFuture<'static, Result<(), WorkerError>> {
        Box::pin(serve(self.bind, ctx))
    }
}

async fn serve(bind: SocketAddr, ctx: WorkerContext) -> Result<(), WorkerError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| WorkerError::ResourceConflict {
            path: PathBuf::from(bind.to_string()),
            reason: e.to_string(),
        })?;
    info!("{} listening on http://{}", ctx.tag(), bind);
    ctx.health.set(Health::Ok);

    let stop = ctx.stop.clone();
    axum::serve(listener, build_router(ctx.device.clone()))
        .with_graceful_shutdown(async move { stop.stopped().await })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusView {
    pub device_id: String,
    pub name: String,
    pub ip: String,
    pub group_id: String,
    pub state: DeviceState,
    pub uptime_secs: u64,
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: String,
    #[serde(default)]
    property: Option<Value>,
}

pub fn build_router(device: DeviceHandle) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(get_health))
        .route("/rename", post(rename))
        .route("/command", post(command))
        .with_state(device)
}

// GET /status
async fn get_status(State(device): State<DeviceHandle>) -> Json<StatusView> {
    Json(StatusView {
        device_id: device.device_id().to_string(),
        name: device.name(),
        ip: device.ip().to_string(),
        group_id: device.group_id().to_string(),
        state: device.state(),
        uptime_secs: device.uptime().as_secs(),
        debug: device.debug(),
    })
}

// GET /health (per worker)
async fn get_health(State(device): State<DeviceHandle>) -> Json<BTreeMap<String, Health>> {
    Json(device.worker_health())
}

// POST /rename {"name"}
async fn rename(State(device): State<DeviceHandle>, Json(body): Json<RenameBody>) -> StatusCode {
    enqueue(&device, "rename", Some(Value::String(body.name)))
}

// POST /command {"command","property"}
async fn command(State(device): State<DeviceHandle>, Json(body): Json<CommandBody>) -> StatusCode {
    enqueue(&device, &body.command, body.property)
}

fn enqueue(device: &DeviceHandle, verb: &str, property: Option<Value>) -> StatusCode {
    if device.put_command(verb, property) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
