//! Connection bookkeeping for the signaling gateway.
//!
//! Each WebSocket connection gets an outbound mpsc sender and, after a
//! successful join, a binding to exactly one (room, peer). Room fan-out
//! targets admitted members only; pending (awaiting-approval) connections
//! are bound but not yet members.

use parley_protocol::ServerMessage;
use std::collections::{HashMap, HashSet};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PeerBinding {
    pub room_id: String,
    pub peer_id: String,
    /// False while the peer waits in the approval queue.
    pub admitted: bool,
}

#[derive(Default)]
pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
    /// Map from connection ID to its room/peer binding
    bindings: RwLock<HashMap<Uuid, PeerBinding>>,
    /// Map from room ID to admitted member connection IDs
    room_members: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_connection(&self, connection_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(connection_id, sender);
        tracing::debug!("connection {} registered", connection_id);
    }

    /// Drops a connection entirely, returning its binding (if any) so the
    /// caller can run the leave path.
    pub async fn remove_connection(&self, connection_id: Uuid) -> Option<PeerBinding> {
        self.senders.write().await.remove(&connection_id);
        let binding = self.bindings.write().await.remove(&connection_id);
        if let Some(binding) = &binding {
            if let Some(members) = self.room_members.write().await.get_mut(&binding.room_id) {
                members.remove(&connection_id);
            }
            tracing::debug!(
                "connection {} unbound from peer {} in room {}",
                connection_id,
                binding.peer_id,
                binding.room_id
            );
        }
        binding
    }

    /// Binds a connection to a room/peer. Admitted connections join the
    /// room's fan-out set immediately; pending ones on `set_admitted`.
    pub async fn bind(&self, connection_id: Uuid, room_id: &str, peer_id: &str, admitted: bool) {
        self.bindings.write().await.insert(
            connection_id,
            PeerBinding {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                admitted,
            },
        );
        if admitted {
            self.room_members
                .write()
                .await
                .entry(room_id.to_string())
                .or_default()
                .insert(connection_id);
        }
    }

    pub async fn set_admitted(&self, connection_id: Uuid) {
        let room_id = {
            let mut bindings = self.bindings.write().await;
            match bindings.get_mut(&connection_id) {
                Some(binding) => {
                    binding.admitted = true;
                    binding.room_id.clone()
                }
                None => return,
            }
        };
        self.room_members
            .write()
            .await
            .entry(room_id)
            .or_default()
            .insert(connection_id);
    }

    pub async fn binding(&self, connection_id: Uuid) -> Option<PeerBinding> {
        self.bindings.read().await.get(&connection_id).cloned()
    }

    /// Removes the binding but keeps the connection alive (deny / explicit
    /// leave — the client may join another room on the same socket).
    pub async fn unbind(&self, connection_id: Uuid) -> Option<PeerBinding> {
        let binding = self.bindings.write().await.remove(&connection_id);
        if let Some(binding) = &binding {
            if let Some(members) = self.room_members.write().await.get_mut(&binding.room_id) {
                members.remove(&connection_id);
            }
        }
        binding
    }

    pub async fn connection_for_peer(&self, room_id: &str, peer_id: &str) -> Option<Uuid> {
        self.bindings
            .read()
            .await
            .iter()
            .find(|(_, b)| b.room_id == room_id && b.peer_id == peer_id)
            .map(|(id, _)| *id)
    }

    pub async fn send_to_connection(&self, connection_id: Uuid, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("failed to serialize message: {}", e);
                return;
            }
        };
        if let Some(sender) = self.senders.read().await.get(&connection_id) {
            if let Err(e) = sender.send(json) {
                tracing::debug!("failed to send to {}: {}", connection_id, e);
            }
        }
    }

    pub async fn send_to_peer(&self, room_id: &str, peer_id: &str, message: &ServerMessage) {
        if let Some(connection_id) = self.connection_for_peer(room_id, peer_id).await {
            self.send_to_connection(connection_id, message).await;
        } else {
            tracing::debug!("no connection for peer {} in room {}", peer_id, room_id);
        }
    }

    /// Fans a message out to every admitted member of a room, optionally
    /// excluding the originator where the event is self-describing.
    pub async fn broadcast_to_room(
        &self,
        room_id: &str,
        message: &ServerMessage,
        except: Option<Uuid>,
    ) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("failed to serialize broadcast: {}", e);
                return;
            }
        };

        let members = self.room_members.read().await;
        let senders = self.senders.read().await;

        if let Some(conn_ids) = members.get(room_id) {
            for conn_id in conn_ids {
                if Some(*conn_id) == except {
                    continue;
                }
                if let Some(sender) = senders.get(conn_id) {
                    if let Err(e) = sender.send(json.clone()) {
                        tracing::debug!("failed to send to {}: {}", conn_id, e);
                    }
                }
            }
        }
    }
}
