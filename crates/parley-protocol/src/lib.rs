//! Parley Protocol
//!
//! Wire types shared between the signaling server and its clients: the
//! bidirectional WebSocket message set and the common data shapes embedded
//! in those messages. Media-engine payloads (RTP parameters, DTLS
//! parameters, ICE candidates) are carried as opaque JSON values; the
//! signaling layer routes them without inspecting their contents.

pub mod messages;
pub mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::{IceServer, MediaKind, PeerInfo, ProducerInfo};
