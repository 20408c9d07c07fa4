use crate::error::Result;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateInviteRequest {
    #[serde(default)]
    pub reusable: bool,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInviteResponse {
    pub token: String,
}

pub async fn create_invite(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Json(req): Json<CreateInviteRequest>,
) -> std::result::Result<Json<CreateInviteResponse>, StatusCode> {
    // Invites only make sense for rooms that exist.
    if state.registry.get(&room_id).await.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let token = state.invites.create(&room_id, req.reusable, req.ttl_secs);
    Ok(Json(CreateInviteResponse { token }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveInviteResponse {
    pub room_id: String,
}

/// Resolves (and, for single-use tokens, consumes) an invite.
pub async fn resolve_invite(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ResolveInviteResponse>> {
    let room_id = state.invites.resolve(&token)?;
    Ok(Json(ResolveInviteResponse { room_id }))
}
