//! Signaling gateway: one long-lived WebSocket per client.
//!
//! A connection has no room membership until its `joinRoom` succeeds; from
//! then on it is bound to exactly one (room, peer) and every message is
//! interpreted against that binding, so a client cannot speak for a peer it
//! is not. An abrupt disconnect takes exactly the same path as an explicit
//! leave — this is the primary failure path and must not leak session
//! state.
//!
//! Lock discipline: engine round-trips never run under a room lock. Each
//! intent reserves/validates under the lock, calls the engine unlocked,
//! then re-acquires the lock to commit or roll back.

use crate::error::SessionError;
use crate::rooms::{Consumer, JoinOutcome, Transport};
use crate::state::AppState;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::{ClientMessage, MediaKind, ServerMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    // Channel for outbound messages; a spawned task owns the sink.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.add_connection(connection_id, tx).await;

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("invalid message on {}: {}", connection_id, e);
                        continue;
                    }
                };
                handle_client_message(&state, connection_id, client_msg).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("websocket error on {}: {}", connection_id, e);
                break;
            }
        }
    }

    // Network drop, tab close, explicit close: all equal an explicit leave.
    do_leave(&state, connection_id).await;
    state.connections.remove_connection(connection_id).await;
    send_task.abort();
    tracing::debug!("connection {} closed", connection_id);
}

async fn handle_client_message(state: &AppState, connection_id: Uuid, message: ClientMessage) {
    let result = match message {
        ClientMessage::JoinRoom {
            room_id,
            peer_id,
            display_name,
            invite_token,
        } => handle_join(state, connection_id, room_id, peer_id, display_name, invite_token).await,
        ClientMessage::LeaveRoom => {
            do_leave(state, connection_id).await;
            Ok(())
        }
        ClientMessage::ApproveJoin { peer_id } => {
            handle_approve(state, connection_id, peer_id).await
        }
        ClientMessage::DenyJoin { peer_id } => handle_deny(state, connection_id, peer_id).await,
        ClientMessage::CreateTransport { consuming } => {
            handle_create_transport(state, connection_id, consuming).await
        }
        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => handle_connect_transport(state, connection_id, transport_id, dtls_parameters).await,
        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => handle_produce(state, connection_id, transport_id, kind, rtp_parameters).await,
        ClientMessage::Consume {
            producer_id,
            rtp_capabilities,
        } => handle_consume(state, connection_id, producer_id, rtp_capabilities).await,
        ClientMessage::ResumeConsumer { consumer_id } => {
            handle_resume_consumer(state, connection_id, consumer_id).await
        }
        ClientMessage::PauseProducer { producer_id } => {
            handle_set_producer_paused(state, connection_id, producer_id, true).await
        }
        ClientMessage::ResumeProducer { producer_id } => {
            handle_set_producer_paused(state, connection_id, producer_id, false).await
        }
        ClientMessage::CloseProducer { producer_id } => {
            handle_close_producer(state, connection_id, producer_id).await
        }
        ClientMessage::GetProducers => handle_get_producers(state, connection_id).await,
    };

    if let Err(err) = result {
        tracing::debug!("request on {} failed: {}", connection_id, err);
        state
            .connections
            .send_to_connection(connection_id, &error_message(&err))
            .await;
    }
}

fn error_message(err: &SessionError) -> ServerMessage {
    ServerMessage::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

/// The binding of a connection that has completed a join.
async fn admitted_binding(
    state: &AppState,
    connection_id: Uuid,
) -> Result<crate::ws::connections::PeerBinding, SessionError> {
    match state.connections.binding(connection_id).await {
        Some(binding) if binding.admitted => Ok(binding),
        _ => Err(SessionError::NotInRoom),
    }
}

async fn handle_join(
    state: &AppState,
    connection_id: Uuid,
    room_id: String,
    peer_id: String,
    display_name: String,
    invite_token: Option<String>,
) -> Result<(), SessionError> {
    // A bound connection may only repeat its own join; anything else would
    // let one socket speak for two peers.
    if let Some(binding) = state.connections.binding(connection_id).await {
        if binding.room_id != room_id || binding.peer_id != peer_id {
            return Err(SessionError::Unauthorized(
                "connection already bound to a room".to_string(),
            ));
        }
    }

    if let Some(token) = &invite_token {
        let invited_room = state.invites.resolve(token)?;
        if invited_room != room_id {
            return Err(SessionError::InviteNotFound);
        }
    }

    let room_lock = state.registry.create_or_get(&room_id, None).await?;
    let outcome = { room_lock.write().await.join(&peer_id, &display_name)? };

    match outcome {
        JoinOutcome::Admitted {
            already_present,
            became_host,
        } => {
            if !already_present {
                if let Err(e) = state.engine.join(&room_id, &peer_id, &display_name).await {
                    room_lock.write().await.remove_peer(&peer_id);
                    destroy_room_if_empty(state, &room_id).await;
                    return Err(e.into());
                }
            }

            let rtp_capabilities = match state.engine.router_capabilities(&room_id).await {
                Ok(caps) => caps,
                Err(e) => {
                    if !already_present {
                        room_lock.write().await.remove_peer(&peer_id);
                        let _ = state.engine.leave(&room_id, &peer_id).await;
                        destroy_room_if_empty(state, &room_id).await;
                    }
                    return Err(e.into());
                }
            };

            let peers = { room_lock.read().await.peer_infos(Some(&peer_id)) };
            state
                .connections
                .bind(connection_id, &room_id, &peer_id, true)
                .await;
            state
                .connections
                .send_to_connection(
                    connection_id,
                    &ServerMessage::RoomJoined {
                        room_id: room_id.clone(),
                        peer_id: peer_id.clone(),
                        peers,
                        rtp_capabilities,
                        ice_servers: state.ice.servers_for(&peer_id),
                    },
                )
                .await;

            if !already_present {
                state
                    .connections
                    .broadcast_to_room(
                        &room_id,
                        &ServerMessage::PeerJoined {
                            peer_id: peer_id.clone(),
                            display_name: display_name.clone(),
                        },
                        Some(connection_id),
                    )
                    .await;
                if became_host {
                    tracing::info!("{} is host of room {}", peer_id, room_id);
                }
                tracing::info!("{} joined room {}", display_name, room_id);
            }
            Ok(())
        }
        JoinOutcome::Pending { already_pending } => {
            state
                .connections
                .bind(connection_id, &room_id, &peer_id, false)
                .await;
            state
                .connections
                .send_to_connection(connection_id, &ServerMessage::WaitingApproval)
                .await;

            if !already_pending {
                let host = { room_lock.read().await.host_peer.clone() };
                if let Some(host_id) = host {
                    state
                        .connections
                        .send_to_peer(
                            &room_id,
                            &host_id,
                            &ServerMessage::ApprovalRequest {
                                peer_id,
                                display_name,
                            },
                        )
                        .await;
                }
            }
            Ok(())
        }
    }
}

async fn handle_approve(
    state: &AppState,
    connection_id: Uuid,
    target_peer: String,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    let display_name = {
        let mut room = room_lock.write().await;
        if !room.is_host(&binding.peer_id) {
            return Err(SessionError::Unauthorized(
                "only the host can approve joins".to_string(),
            ));
        }
        room.approve(&target_peer)?
    };

    // The approved peer must still be connected to receive its session.
    let Some(target_conn) = state
        .connections
        .connection_for_peer(&binding.room_id, &target_peer)
        .await
    else {
        room_lock.write().await.remove_peer(&target_peer);
        return Err(SessionError::PeerNotFound(target_peer));
    };

    if let Err(e) = state
        .engine
        .join(&binding.room_id, &target_peer, &display_name)
        .await
    {
        room_lock.write().await.remove_peer(&target_peer);
        let err: SessionError = e.into();
        state
            .connections
            .send_to_connection(target_conn, &error_message(&err))
            .await;
        return Err(err);
    }

    let rtp_capabilities = match state.engine.router_capabilities(&binding.room_id).await {
        Ok(caps) => caps,
        Err(e) => {
            room_lock.write().await.remove_peer(&target_peer);
            let _ = state.engine.leave(&binding.room_id, &target_peer).await;
            let err: SessionError = e.into();
            state
                .connections
                .send_to_connection(target_conn, &error_message(&err))
                .await;
            return Err(err);
        }
    };

    let peers = { room_lock.read().await.peer_infos(Some(&target_peer)) };
    state.connections.set_admitted(target_conn).await;
    state
        .connections
        .send_to_connection(
            target_conn,
            &ServerMessage::RoomJoined {
                room_id: binding.room_id.clone(),
                peer_id: target_peer.clone(),
                peers,
                rtp_capabilities,
                ice_servers: state.ice.servers_for(&target_peer),
            },
        )
        .await;
    state
        .connections
        .broadcast_to_room(
            &binding.room_id,
            &ServerMessage::PeerJoined {
                peer_id: target_peer.clone(),
                display_name,
            },
            Some(target_conn),
        )
        .await;

    tracing::info!("{} approved into room {}", target_peer, binding.room_id);
    Ok(())
}

async fn handle_deny(
    state: &AppState,
    connection_id: Uuid,
    target_peer: String,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    {
        let mut room = room_lock.write().await;
        if !room.is_host(&binding.peer_id) {
            return Err(SessionError::Unauthorized(
                "only the host can deny joins".to_string(),
            ));
        }
        room.deny(&target_peer)?;
    }

    if let Some(target_conn) = state
        .connections
        .connection_for_peer(&binding.room_id, &target_peer)
        .await
    {
        state
            .connections
            .send_to_connection(target_conn, &ServerMessage::JoinDenied)
            .await;
        state.connections.unbind(target_conn).await;
    }

    tracing::info!("{} denied entry to room {}", target_peer, binding.room_id);
    Ok(())
}

async fn handle_create_transport(
    state: &AppState,
    connection_id: Uuid,
    consuming: bool,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    // Reserve under the lock, allocate unlocked, commit or roll back.
    {
        room_lock
            .write()
            .await
            .reserve_transport(&binding.peer_id, consuming)?;
    }

    let created = match state
        .engine
        .create_transport(&binding.room_id, &binding.peer_id, consuming)
        .await
    {
        Ok(t) => t,
        Err(e) => {
            room_lock
                .write()
                .await
                .rollback_transport(&binding.peer_id, consuming);
            return Err(e.into());
        }
    };

    let committed = {
        room_lock.write().await.commit_transport(
            &binding.peer_id,
            consuming,
            Transport {
                id: created.id.clone(),
                connected: false,
            },
        )
    };

    match committed {
        Ok(replaced) => {
            if let Some(old_id) = replaced {
                // Browser retried transport setup; drop the orphan.
                if let Err(e) = state
                    .engine
                    .close_transport(&binding.room_id, &binding.peer_id, &old_id)
                    .await
                {
                    tracing::warn!("closing replaced transport {} failed: {}", old_id, e);
                }
            }
            state
                .connections
                .send_to_connection(
                    connection_id,
                    &ServerMessage::TransportCreated {
                        consuming,
                        transport_id: created.id,
                        ice_parameters: created.ice_parameters,
                        ice_candidates: created.ice_candidates,
                        dtls_parameters: created.dtls_parameters,
                    },
                )
                .await;
            Ok(())
        }
        Err(e) => {
            // Peer left between the engine call and the commit.
            let _ = state
                .engine
                .close_transport(&binding.room_id, &binding.peer_id, &created.id)
                .await;
            Err(e)
        }
    }
}

async fn handle_connect_transport(
    state: &AppState,
    connection_id: Uuid,
    transport_id: String,
    dtls_parameters: Value,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    {
        room_lock
            .read()
            .await
            .verify_transport(&binding.peer_id, &transport_id)?;
    }

    state
        .engine
        .connect_transport(
            &binding.room_id,
            &binding.peer_id,
            &transport_id,
            dtls_parameters,
        )
        .await?;

    {
        room_lock
            .write()
            .await
            .transport_connected(&binding.peer_id, &transport_id)?;
    }

    state
        .connections
        .send_to_connection(
            connection_id,
            &ServerMessage::TransportConnected { transport_id },
        )
        .await;
    Ok(())
}

async fn handle_produce(
    state: &AppState,
    connection_id: Uuid,
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    {
        room_lock
            .read()
            .await
            .verify_send_transport(&binding.peer_id, &transport_id)?;
    }

    let producer_id = state
        .engine
        .produce(
            &binding.room_id,
            &binding.peer_id,
            &transport_id,
            kind,
            rtp_parameters,
        )
        .await?;

    let registered = {
        room_lock
            .write()
            .await
            .register_producer(&binding.peer_id, kind, &producer_id)
    };
    let replaced = match registered {
        Ok(replaced) => replaced,
        Err(e) => {
            // Peer vanished mid-call; pair the local rollback with an
            // engine-side close.
            let _ = state
                .engine
                .close_producer(&binding.room_id, &binding.peer_id, &producer_id)
                .await;
            return Err(e);
        }
    };

    // A retried produce of the same kind replaces the earlier producer.
    if let Some(old_id) = replaced {
        if let Err(e) = state
            .engine
            .close_producer(&binding.room_id, &binding.peer_id, &old_id)
            .await
        {
            tracing::warn!("closing replaced producer {} failed: {}", old_id, e);
        }
        state
            .connections
            .broadcast_to_room(
                &binding.room_id,
                &ServerMessage::ProducerClosed {
                    peer_id: binding.peer_id.clone(),
                    producer_id: old_id,
                },
                Some(connection_id),
            )
            .await;
    }

    state
        .connections
        .send_to_connection(
            connection_id,
            &ServerMessage::Produced {
                producer_id: producer_id.clone(),
                kind,
            },
        )
        .await;
    state
        .connections
        .broadcast_to_room(
            &binding.room_id,
            &ServerMessage::NewProducer {
                producer_id,
                peer_id: binding.peer_id.clone(),
                kind,
            },
            Some(connection_id),
        )
        .await;
    Ok(())
}

async fn handle_consume(
    state: &AppState,
    connection_id: Uuid,
    producer_id: String,
    rtp_capabilities: Value,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    {
        room_lock
            .read()
            .await
            .verify_consume(&binding.peer_id, &producer_id)?;
    }

    // The producer can close between the check above and this call; the
    // engine then reports producerNotFound, which the client treats as a
    // recoverable race, not a fault.
    let consumer = state
        .engine
        .consume(
            &binding.room_id,
            &binding.peer_id,
            &producer_id,
            rtp_capabilities,
        )
        .await?;

    {
        room_lock.write().await.register_consumer(
            &binding.peer_id,
            Consumer {
                id: consumer.id.clone(),
                producer_id: consumer.producer_id.clone(),
                paused: true,
            },
        )?;
    }

    state
        .connections
        .send_to_connection(
            connection_id,
            &ServerMessage::Consumed {
                consumer_id: consumer.id,
                producer_id: consumer.producer_id,
                kind: consumer.kind,
                rtp_parameters: consumer.rtp_parameters,
            },
        )
        .await;
    Ok(())
}

async fn handle_resume_consumer(
    state: &AppState,
    connection_id: Uuid,
    consumer_id: String,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    {
        room_lock
            .read()
            .await
            .verify_consumer_owner(&binding.peer_id, &consumer_id)?;
    }

    state
        .engine
        .resume_consumer(&binding.room_id, &binding.peer_id, &consumer_id)
        .await?;

    {
        // The consumer may have been cascaded away mid-call; benign.
        let _ = room_lock
            .write()
            .await
            .resume_consumer(&binding.peer_id, &consumer_id);
    }

    state
        .connections
        .send_to_connection(connection_id, &ServerMessage::ConsumerResumed { consumer_id })
        .await;
    Ok(())
}

async fn handle_set_producer_paused(
    state: &AppState,
    connection_id: Uuid,
    producer_id: String,
    paused: bool,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    {
        room_lock
            .read()
            .await
            .verify_producer_owner(&binding.peer_id, &producer_id)?;
    }

    if paused {
        state
            .engine
            .pause_producer(&binding.room_id, &binding.peer_id, &producer_id)
            .await?;
    } else {
        state
            .engine
            .resume_producer(&binding.room_id, &binding.peer_id, &producer_id)
            .await?;
    }

    {
        let _ = room_lock
            .write()
            .await
            .set_producer_paused(&binding.peer_id, &producer_id, paused);
    }

    let message = if paused {
        ServerMessage::ProducerPaused {
            peer_id: binding.peer_id.clone(),
            producer_id,
        }
    } else {
        ServerMessage::ProducerResumed {
            peer_id: binding.peer_id.clone(),
            producer_id,
        }
    };
    state
        .connections
        .broadcast_to_room(&binding.room_id, &message, Some(connection_id))
        .await;
    Ok(())
}

async fn handle_close_producer(
    state: &AppState,
    connection_id: Uuid,
    producer_id: String,
) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    {
        room_lock
            .read()
            .await
            .verify_producer_owner(&binding.peer_id, &producer_id)?;
    }

    state
        .engine
        .close_producer(&binding.room_id, &binding.peer_id, &producer_id)
        .await?;

    {
        room_lock.write().await.remove_producer_by_id(&producer_id);
    }

    state
        .connections
        .broadcast_to_room(
            &binding.room_id,
            &ServerMessage::ProducerClosed {
                peer_id: binding.peer_id.clone(),
                producer_id,
            },
            Some(connection_id),
        )
        .await;
    Ok(())
}

async fn handle_get_producers(state: &AppState, connection_id: Uuid) -> Result<(), SessionError> {
    let binding = admitted_binding(state, connection_id).await?;
    let room_lock = state
        .registry
        .get(&binding.room_id)
        .await
        .ok_or(SessionError::NotInRoom)?;

    let producers = { room_lock.read().await.list_producers(Some(&binding.peer_id)) };
    state
        .connections
        .send_to_connection(connection_id, &ServerMessage::Producers { producers })
        .await;
    Ok(())
}

/// Shared leave path for explicit `leaveRoom` and socket teardown. Safe to
/// call repeatedly; only the first call finds a binding.
pub(crate) async fn do_leave(state: &AppState, connection_id: Uuid) {
    let Some(binding) = state.connections.unbind(connection_id).await else {
        return;
    };

    if !binding.admitted {
        // Withdraw the pending request; nothing was allocated for it.
        if let Some(room_lock) = state.registry.get(&binding.room_id).await {
            let _ = room_lock.write().await.deny(&binding.peer_id);
        }
        return;
    }

    let outcome = state
        .registry
        .leave(&binding.room_id, &binding.peer_id)
        .await;

    for producer_id in &outcome.closed_producers {
        state
            .connections
            .broadcast_to_room(
                &binding.room_id,
                &ServerMessage::ProducerClosed {
                    peer_id: binding.peer_id.clone(),
                    producer_id: producer_id.clone(),
                },
                None,
            )
            .await;
    }

    if let Some(display_name) = outcome.display_name {
        state
            .connections
            .broadcast_to_room(
                &binding.room_id,
                &ServerMessage::PeerLeft {
                    peer_id: binding.peer_id.clone(),
                    display_name: display_name.clone(),
                },
                None,
            )
            .await;
        tracing::info!("{} left room {}", display_name, binding.room_id);
    }

    if outcome.room_destroyed {
        state.invites.remove_room(&binding.room_id);
        notify_denied(state, &binding.room_id, outcome.denied_pending).await;
    }
}

/// Destroys a room that emptied outside the leave path (join rollback),
/// denying whoever was still queued.
async fn destroy_room_if_empty(state: &AppState, room_id: &str) {
    if let Some(denied) = state.registry.destroy_if_empty(room_id).await {
        state.invites.remove_room(room_id);
        notify_denied(state, room_id, denied).await;
    }
}

async fn notify_denied(
    state: &AppState,
    room_id: &str,
    denied: Vec<crate::rooms::room::PendingJoin>,
) {
    for entry in denied {
        if let Some(conn) = state
            .connections
            .connection_for_peer(room_id, &entry.peer_id)
            .await
        {
            state
                .connections
                .send_to_connection(conn, &ServerMessage::JoinDenied)
                .await;
            state.connections.unbind(conn).await;
        }
    }
}
