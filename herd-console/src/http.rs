//! Read-only HTTP view of the fleet table.

use crate::fleet::{FleetAggregator, FleetEntry};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ConsoleHealth {
    status: &'static str,
    devices: usize,
    online: usize,
}

pub fn build_router(fleet: FleetAggregator) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/fleet", get(get_fleet))
        .route("/fleet/{id}", get(get_device))
        .with_state(fleet)
}

// GET /health
async fn get_health(State(fleet): State<FleetAggregator>) -> Json<ConsoleHealth> {
    let snapshot = fleet.snapshot();
    Json(ConsoleHealth {
        status: "ok",
        devices: snapshot.len(),
        online: snapshot.iter().filter(|e| e.online).count(),
    })
}

// GET /fleet
async fn get_fleet(State(fleet): State<FleetAggregator>) -> Json<Vec<FleetEntry>> {
    Json(fleet.snapshot())
}

// GET /fleet/{id}
async fn get_device(State(fleet): State<FleetAggregator>, Path(id): Path<String>) -> Result<Json<FleetEntry>, StatusCode> {
    fleet.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}
