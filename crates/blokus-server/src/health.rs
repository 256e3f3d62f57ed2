use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub instance: String,
    pub connections: ConnectionInfo,
    pub rooms: RoomInfo,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
}

#[derive(Serialize)]
pub struct RoomInfo {
    /// Rooms whose actor runs in this process.
    pub owned: usize,
    /// Rooms with at least one local connection.
    pub subscribed: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let websocket = state.ws_connection_count.load(Ordering::Relaxed);
    let owned = state.rooms.active_rooms().await;
    let (subscribed, _) = state.relay.stats().await;

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        instance: state.config.instance_id.clone(),
        connections: ConnectionInfo { websocket },
        rooms: RoomInfo { owned, subscribed },
    })
}
