//! Pump for engine push notifications.
//!
//! Every engine-originated event is reflected in the local bookkeeping
//! first and only then fanned out to clients, so no client ever observes a
//! producer the server has already forgotten, or vice versa.

use crate::engine::EngineNotification;
use crate::state::AppState;
use parley_protocol::ServerMessage;
use tokio::sync::mpsc;

pub async fn run(state: AppState, mut notifications: mpsc::UnboundedReceiver<EngineNotification>) {
    while let Some(notification) = notifications.recv().await {
        handle(&state, notification).await;
    }
}

async fn handle(state: &AppState, notification: EngineNotification) {
    match notification {
        EngineNotification::ProducerClosed {
            room_id,
            producer_id,
        } => {
            let Some(room_lock) = state.registry.get(&room_id).await else {
                return;
            };
            let removed = { room_lock.write().await.remove_producer_by_id(&producer_id) };
            if let Some((owner, _kind)) = removed {
                tracing::debug!("engine closed producer {} in room {}", producer_id, room_id);
                state
                    .connections
                    .broadcast_to_room(
                        &room_id,
                        &ServerMessage::ProducerClosed {
                            peer_id: owner,
                            producer_id,
                        },
                        None,
                    )
                    .await;
            }
        }
        EngineNotification::NewProducer {
            room_id,
            peer_id,
            producer_id,
            kind,
        } => {
            let Some(room_lock) = state.registry.get(&room_id).await else {
                return;
            };
            // Usually we already know this producer because we created it;
            // only genuinely new ones are adopted and announced.
            let (is_new, replaced) = {
                let mut room = room_lock.write().await;
                if room.find_producer(&producer_id).is_some() {
                    (false, None)
                } else {
                    match room.register_producer(&peer_id, kind, &producer_id) {
                        Ok(replaced) => (true, replaced),
                        Err(_) => (false, None),
                    }
                }
            };

            if let Some(old_id) = replaced {
                state
                    .connections
                    .broadcast_to_room(
                        &room_id,
                        &ServerMessage::ProducerClosed {
                            peer_id: peer_id.clone(),
                            producer_id: old_id,
                        },
                        None,
                    )
                    .await;
            }
            if is_new {
                let owner_conn = state.connections.connection_for_peer(&room_id, &peer_id).await;
                state
                    .connections
                    .broadcast_to_room(
                        &room_id,
                        &ServerMessage::NewProducer {
                            producer_id,
                            peer_id,
                            kind,
                        },
                        owner_conn,
                    )
                    .await;
            }
        }
    }
}
