//! Room registry: the only process-wide mutable structure.
//!
//! The registry map lives under its own lock, distinct from each room's
//! internal lock, so lookups never contend with in-room mutations. Room
//! creation allocates the engine-side router while holding the registry
//! lock — room creation and the first join that follows are serialized, so
//! exactly one of two racing first joiners to a gated room becomes host.

use crate::engine::EngineClient;
use crate::error::SessionError;
use crate::rooms::room::{PendingJoin, Room, RoomOptions};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, RwLock};

/// What a leave released, for the gateway to fan out.
#[derive(Debug, Default)]
pub struct LeaveOutcome {
    /// `None` when the peer was unknown (duplicate leave — a no-op).
    pub display_name: Option<String>,
    pub closed_producers: Vec<String>,
    /// Pending join requests denied because the room died with them queued.
    pub denied_pending: Vec<PendingJoin>,
    pub room_destroyed: bool,
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<RwLock<Room>>>>,
    engine: EngineClient,
    next_worker: AtomicUsize,
    engine_workers: usize,
    default_max_peers: Option<usize>,
}

impl RoomRegistry {
    pub fn new(
        engine: EngineClient,
        engine_workers: usize,
        default_max_peers: Option<usize>,
    ) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            engine,
            next_worker: AtomicUsize::new(0),
            engine_workers: engine_workers.max(1),
            default_max_peers,
        }
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<RwLock<Room>>> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    pub async fn room_ids(&self) -> Vec<String> {
        self.rooms.lock().await.keys().cloned().collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Idempotent lookup-or-create. On first creation an engine router is
    /// allocated on a round-robin-selected worker; if that call fails the
    /// room is not registered and stays creatable on retry.
    pub async fn create_or_get(
        &self,
        room_id: &str,
        options: Option<RoomOptions>,
    ) -> Result<Arc<RwLock<Room>>, SessionError> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(room_id) {
            return Ok(room.clone());
        }

        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.engine_workers;
        self.engine.create_router(room_id, worker).await?;

        let opts = options.unwrap_or(RoomOptions {
            access_mode: Default::default(),
            max_peers: self.default_max_peers,
        });
        let room = Arc::new(RwLock::new(Room::new(room_id, opts)));
        rooms.insert(room_id.to_string(), room.clone());
        tracing::info!("created room {} on engine worker {}", room_id, worker);
        Ok(room)
    }

    /// Removes a peer and, if the room empties, the room itself. Always
    /// completes locally: engine-side teardown failures are logged and left
    /// to the reconciliation sweep, never allowed to block the leave.
    pub async fn leave(&self, room_id: &str, peer_id: &str) -> LeaveOutcome {
        let Some(room_lock) = self.get(room_id).await else {
            return LeaveOutcome::default();
        };

        let teardown = { room_lock.write().await.remove_peer(peer_id) };
        let Some(teardown) = teardown else {
            return LeaveOutcome::default();
        };

        tracing::debug!(
            "peer {} leaving {}: {} producers, {} transports to release",
            peer_id,
            room_id,
            teardown.closed_producers.len(),
            teardown.closed_transports.len()
        );

        match self.engine.leave(room_id, peer_id).await {
            Ok(engine_closed) => {
                if engine_closed.len() != teardown.closed_producers.len() {
                    tracing::debug!(
                        "engine closed {} producers for {} in {}, local bookkeeping had {}",
                        engine_closed.len(),
                        peer_id,
                        room_id,
                        teardown.closed_producers.len()
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    "engine leave for {} in {} failed (will reconcile): {}",
                    peer_id,
                    room_id,
                    e
                );
            }
        }

        let denied = self.destroy_if_empty(room_id).await;
        let room_destroyed = denied.is_some();
        LeaveOutcome {
            display_name: Some(teardown.display_name),
            closed_producers: teardown.closed_producers,
            denied_pending: denied.unwrap_or_default(),
            room_destroyed,
        }
    }

    /// Destroys the room if it has no peers left. The registry lock makes
    /// the removal — and with it the engine router release — exactly-once.
    /// Returns the drained pending-join entries when the room was removed.
    pub async fn destroy_if_empty(&self, room_id: &str) -> Option<Vec<PendingJoin>> {
        let denied = {
            let mut rooms = self.rooms.lock().await;
            let room_lock = rooms.get(room_id)?;
            let mut room = room_lock.write().await;
            if !room.is_empty() {
                return None;
            }
            let denied = room.drain_pending();
            drop(room);
            rooms.remove(room_id);
            denied
        };

        if let Err(e) = self.engine.close_router(room_id).await {
            tracing::warn!("engine closeRouter for {} failed: {}", room_id, e);
        }
        tracing::info!("destroyed empty room {}", room_id);
        Some(denied)
    }
}

/// Generates a short shareable room id like `abc-def-ghi`.
pub fn generate_room_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..3)
        .map(|_| {
            (0..3)
                .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("-")
}
