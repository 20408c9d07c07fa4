use parley_protocol::MediaKind;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Errors from the media engine adapter.
///
/// `Remote` carries the engine's structured `{code, message}` pair; the
/// other variants are transport-level failures on our side of the socket.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("engine not connected")]
    NotConnected,

    #[error("engine call timed out")]
    Timeout,

    #[error("engine connection closed mid-call")]
    ConnectionClosed,

    #[error("engine error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("engine protocol error: {0}")]
    Protocol(String),
}

/// Transport descriptor returned by `createWebRtcTransport`.
///
/// ICE/DTLS payloads are opaque to the signaling layer and are relayed to
/// the client untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Consumer descriptor returned by `consume`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCreated {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// One entry of a `getProducers` reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProducer {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
}

/// Push notifications from the engine (JSON-RPC messages without an id).
#[derive(Debug, Clone)]
pub enum EngineNotification {
    NewProducer {
        room_id: String,
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    },
    ProducerClosed {
        room_id: String,
        producer_id: String,
    },
}
