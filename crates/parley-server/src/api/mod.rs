mod invites;
mod rooms;

use crate::state::AppState;
use crate::ws;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Room routes
        .route("/api/rooms", post(rooms::create_room))
        .route("/api/rooms/{id}/status", get(rooms::room_status))
        .route("/api/rooms/{id}/invites", post(invites::create_invite))
        // Invite resolution
        .route("/api/invites/{token}", post(invites::resolve_invite))
        // ICE configuration for clients
        .route("/api/ice-servers", get(rooms::ice_servers))
        // Server status
        .route("/api/status", get(rooms::server_status))
        // WebSocket endpoint
        .route("/ws", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
