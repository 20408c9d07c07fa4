use crate::engine::EngineError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Session-layer errors surfaced to clients with stable wire codes.
///
/// These never crash a room or affect other peers; races inherent to
/// multi-party signaling (a producer closing between discovery and consume,
/// a duplicate leave) are soft errors the client recovers from.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("room is full")]
    RoomFull,

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("receiver capabilities cannot consume this producer")]
    IncompatibleCapabilities,

    #[error("media engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("invite expired")]
    InviteExpired,

    #[error("invite not found")]
    InviteNotFound,

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("connection is not bound to a room")]
    NotInRoom,
}

impl SessionError {
    /// Stable machine-readable code carried in `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::RoomFull => "roomFull",
            SessionError::PeerNotFound(_) => "peerNotFound",
            SessionError::TransportNotFound(_) => "transportNotFound",
            SessionError::ProducerNotFound(_) => "producerNotFound",
            SessionError::ConsumerNotFound(_) => "consumerNotFound",
            SessionError::IncompatibleCapabilities => "incompatibleCapabilities",
            SessionError::EngineUnavailable(_) => "engineUnavailable",
            SessionError::InviteExpired => "inviteExpired",
            SessionError::InviteNotFound => "inviteNotFound",
            SessionError::Unauthorized(_) => "unauthorized",
            SessionError::NotInRoom => "notInRoom",
        }
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            // Recognized structured codes from the engine keep their
            // session-level meaning; everything else degrades to
            // EngineUnavailable so the client-visible taxonomy stays closed.
            EngineError::Remote { ref code, ref message } => match code.as_str() {
                "producerNotFound" => SessionError::ProducerNotFound(message.clone()),
                "transportNotFound" => SessionError::TransportNotFound(message.clone()),
                "peerNotFound" => SessionError::PeerNotFound(message.clone()),
                "incompatibleCapabilities" => SessionError::IncompatibleCapabilities,
                _ => SessionError::EngineUnavailable(err.to_string()),
            },
            other => SessionError::EngineUnavailable(other.to_string()),
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::RoomFull => StatusCode::CONFLICT,
            SessionError::PeerNotFound(_)
            | SessionError::TransportNotFound(_)
            | SessionError::ProducerNotFound(_)
            | SessionError::ConsumerNotFound(_)
            | SessionError::InviteNotFound => StatusCode::NOT_FOUND,
            SessionError::InviteExpired => StatusCode::GONE,
            SessionError::IncompatibleCapabilities => StatusCode::UNPROCESSABLE_ENTITY,
            SessionError::Unauthorized(_) => StatusCode::FORBIDDEN,
            SessionError::NotInRoom => StatusCode::BAD_REQUEST,
            SessionError::EngineUnavailable(e) => {
                tracing::error!("engine unavailable: {}", e);
                StatusCode::BAD_GATEWAY
            }
        };

        let body = Json(json!({
            "code": self.code(),
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
