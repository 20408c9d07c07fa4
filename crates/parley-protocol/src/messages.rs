use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{IceServer, MediaKind, PeerInfo, ProducerInfo};

/// Messages sent from client to server via WebSocket.
///
/// The first message on a connection must be `JoinRoom`; everything else is
/// rejected until the connection is bound to a room and peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a room, creating it if it does not exist
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        peer_id: String,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invite_token: Option<String>,
    },

    /// Leave the current room
    LeaveRoom,

    /// Approve a pending join request (host only)
    #[serde(rename_all = "camelCase")]
    ApproveJoin { peer_id: String },

    /// Deny a pending join request (host only)
    #[serde(rename_all = "camelCase")]
    DenyJoin { peer_id: String },

    /// Create a WebRTC transport (send or receive side)
    CreateTransport { consuming: bool },

    /// Complete the DTLS handshake for a transport
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },

    /// Publish a media stream on the send transport
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },

    /// Subscribe to a remote producer
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        rtp_capabilities: Value,
    },

    /// Unpause a consumer once the client has wired up playback
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: String },

    /// Pause a producer (mute)
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: String },

    /// Resume a producer (unmute)
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: String },

    /// Close a producer
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: String },

    /// List producers of the other peers in the room
    GetProducers,
}

/// Messages sent from server to client via WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Room joined successfully
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_id: String,
        peer_id: String,
        peers: Vec<PeerInfo>,
        rtp_capabilities: Value,
        ice_servers: Vec<IceServer>,
    },

    /// Join is waiting on host approval
    WaitingApproval,

    /// A peer is waiting to join (sent to the host only)
    #[serde(rename_all = "camelCase")]
    ApprovalRequest {
        peer_id: String,
        display_name: String,
    },

    /// The host denied this client's join request
    JoinDenied,

    /// Another peer joined the room
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer_id: String,
        display_name: String,
    },

    /// A peer left the room
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: String,
        display_name: String,
    },

    /// Transport created
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        consuming: bool,
        transport_id: String,
        ice_parameters: Value,
        ice_candidates: Value,
        dtls_parameters: Value,
    },

    /// Transport DTLS handshake completed
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },

    /// This client's produce request succeeded
    #[serde(rename_all = "camelCase")]
    Produced {
        producer_id: String,
        kind: MediaKind,
    },

    /// A new producer is available from another peer
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
    },

    /// This client's consume request succeeded; the consumer starts paused
    #[serde(rename_all = "camelCase")]
    Consumed {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
    },

    /// Consumer unpaused
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },

    /// A producer was closed
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        peer_id: String,
        producer_id: String,
    },

    /// A producer was paused by its owner
    #[serde(rename_all = "camelCase")]
    ProducerPaused {
        peer_id: String,
        producer_id: String,
    },

    /// A producer was resumed by its owner
    #[serde(rename_all = "camelCase")]
    ProducerResumed {
        peer_id: String,
        producer_id: String,
    },

    /// Reply to `getProducers`
    Producers { producers: Vec<ProducerInfo> },

    /// Error response with a stable machine-readable code
    Error { code: String, message: String },
}
