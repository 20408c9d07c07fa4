use crate::error::Result;
use crate::rooms::{AccessMode, RoomOptions, generate_room_id};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use parley_protocol::IceServer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub room_id: Option<String>,
    #[serde(default)]
    pub access_mode: AccessMode,
    pub max_peers: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    pub room_id: String,
    pub access_mode: AccessMode,
    pub max_peers: Option<usize>,
}

/// Pre-creates a room with explicit options. Rooms joined over WebSocket
/// without pre-creation come up open with the configured defaults; this is
/// how a host sets up an approval-gated or capped room.
pub async fn create_room(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<Json<RoomResponse>> {
    let room_id = req.room_id.unwrap_or_else(generate_room_id);
    let options = RoomOptions {
        access_mode: req.access_mode,
        max_peers: req.max_peers,
    };
    let room_lock = state.registry.create_or_get(&room_id, Some(options)).await?;

    let room = room_lock.read().await;
    Ok(Json(RoomResponse {
        room_id: room.id.clone(),
        access_mode: room.access_mode,
        max_peers: room.max_peers,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatusResponse {
    pub room_id: String,
    pub access_mode: AccessMode,
    pub peer_count: usize,
    pub pending_count: usize,
    pub producer_count: usize,
    pub created_at: DateTime<Utc>,
    /// Forwarding-side stats straight from the engine; null when the
    /// engine cannot be reached.
    pub engine_stats: serde_json::Value,
}

pub async fn room_status(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> std::result::Result<Json<RoomStatusResponse>, StatusCode> {
    let room_lock = state
        .registry
        .get(&room_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    let engine_stats = state
        .engine
        .get_stats(&room_id)
        .await
        .unwrap_or(serde_json::Value::Null);

    let room = room_lock.read().await;
    Ok(Json(RoomStatusResponse {
        room_id: room.id.clone(),
        access_mode: room.access_mode,
        peer_count: room.peer_count(),
        pending_count: room.pending_count(),
        producer_count: room.producer_count(),
        created_at: room.created_at,
        engine_stats,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServersQuery {
    pub peer_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

pub async fn ice_servers(
    State(state): State<AppState>,
    Query(query): Query<IceServersQuery>,
) -> Json<IceServersResponse> {
    let peer_id = query.peer_id.as_deref().unwrap_or("anonymous");
    Json(IceServersResponse {
        ice_servers: state.ice.servers_for(peer_id),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusResponse {
    pub rooms: usize,
    pub peers: usize,
    pub engine_connected: bool,
}

pub async fn server_status(State(state): State<AppState>) -> Json<ServerStatusResponse> {
    let mut peers = 0;
    for room_id in state.registry.room_ids().await {
        if let Some(room_lock) = state.registry.get(&room_id).await {
            peers += room_lock.read().await.peer_count();
        }
    }
    Json(ServerStatusResponse {
        rooms: state.registry.room_count().await,
        peers,
        engine_connected: state.engine.is_connected() && state.engine.ping().await,
    })
}
