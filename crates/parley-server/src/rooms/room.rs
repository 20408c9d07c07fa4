//! Room session state machine.
//!
//! Pure local bookkeeping: rooms own peers, peers own transports, producers
//! and consumers. Nothing here talks to the media engine — the gateway
//! orchestrates engine calls between lock acquisitions so no room lock is
//! ever held across a remote round-trip. Every mutation is deterministic
//! and runs under the room's exclusive write lock.

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use parley_protocol::{MediaKind, PeerInfo, ProducerInfo};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Who may enter a room directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum AccessMode {
    #[default]
    Open,
    HostApproval,
}

/// Options fixed at room creation.
#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    pub access_mode: AccessMode,
    /// Peer cap; `None` means unlimited.
    pub max_peers: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Joining,
    AwaitingApproval,
    Active,
    Left,
}

#[derive(Debug, Clone)]
pub struct Transport {
    pub id: String,
    pub connected: bool,
}

#[derive(Debug, Clone)]
pub struct Producer {
    pub id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// A subscription to a remote producer. Created paused; forwarding starts
/// only after the client acknowledges readiness.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: String,
    pub producer_id: String,
    pub paused: bool,
}

#[derive(Debug)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    pub state: PeerState,
    join_order: u64,
    pub send_transport: Option<Transport>,
    pub recv_transport: Option<Transport>,
    // Reservation flags for in-flight transport creation: set under the
    // room lock before the engine call, cleared on commit or rollback.
    send_reserved: bool,
    recv_reserved: bool,
    pub producers: HashMap<MediaKind, Producer>,
    pub consumers: HashMap<String, Consumer>,
}

impl Peer {
    fn new(id: &str, display_name: &str, join_order: u64) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            state: PeerState::Joining,
            join_order,
            send_transport: None,
            recv_transport: None,
            send_reserved: false,
            recv_reserved: false,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }
}

/// A join request waiting on the host's decision. No engine-side resources
/// exist yet, so denying releases nothing.
#[derive(Debug, Clone)]
pub struct PendingJoin {
    pub peer_id: String,
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
}

/// Outcome of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The peer is Active. `already_present` marks a tolerated duplicate
    /// join; `became_host` marks the first joiner of a host-approval room.
    Admitted {
        already_present: bool,
        became_host: bool,
    },
    /// The peer is queued for host approval.
    Pending { already_pending: bool },
}

/// Everything released when a peer leaves, for the gateway to pair with
/// engine-side closes and notifications.
#[derive(Debug, Default)]
pub struct PeerTeardown {
    pub display_name: String,
    pub closed_producers: Vec<String>,
    pub closed_transports: Vec<String>,
    pub host_passed_to: Option<String>,
}

#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub access_mode: AccessMode,
    pub max_peers: Option<usize>,
    /// Approving authority in host-approval rooms; `None` until the first
    /// joiner claims it.
    pub host_peer: Option<String>,
    peers: HashMap<String, Peer>,
    pending: Vec<PendingJoin>,
    next_join_order: u64,
}

impl Room {
    pub fn new(id: &str, options: RoomOptions) -> Self {
        Self {
            id: id.to_string(),
            created_at: Utc::now(),
            access_mode: options.access_mode,
            max_peers: options.max_peers,
            host_peer: None,
            peers: HashMap::new(),
            pending: Vec::new(),
            next_join_order: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_host(&self, peer_id: &str) -> bool {
        self.host_peer.as_deref() == Some(peer_id)
    }

    pub fn contains_active(&self, peer_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|p| p.state == PeerState::Active)
    }

    /// Attempts to join. Duplicate joins (same peer id already Active or
    /// already pending) are tolerated no-ops returning current state.
    pub fn join(
        &mut self,
        peer_id: &str,
        display_name: &str,
    ) -> Result<JoinOutcome, SessionError> {
        if self.peers.contains_key(peer_id) {
            return Ok(JoinOutcome::Admitted {
                already_present: true,
                became_host: false,
            });
        }
        if self.pending.iter().any(|p| p.peer_id == peer_id) {
            return Ok(JoinOutcome::Pending {
                already_pending: true,
            });
        }

        match self.access_mode {
            AccessMode::Open => {
                self.admit(peer_id, display_name)?;
                Ok(JoinOutcome::Admitted {
                    already_present: false,
                    became_host: false,
                })
            }
            AccessMode::HostApproval => {
                // First joiner of a gated room becomes host and enters
                // directly; there is nobody yet who could approve them.
                if self.host_peer.is_none() {
                    self.admit(peer_id, display_name)?;
                    self.host_peer = Some(peer_id.to_string());
                    Ok(JoinOutcome::Admitted {
                        already_present: false,
                        became_host: true,
                    })
                } else {
                    self.pending.push(PendingJoin {
                        peer_id: peer_id.to_string(),
                        display_name: display_name.to_string(),
                        requested_at: Utc::now(),
                    });
                    Ok(JoinOutcome::Pending {
                        already_pending: false,
                    })
                }
            }
        }
    }

    fn admit(&mut self, peer_id: &str, display_name: &str) -> Result<(), SessionError> {
        if let Some(cap) = self.max_peers {
            if self.peers.len() >= cap {
                return Err(SessionError::RoomFull);
            }
        }
        let order = self.next_join_order;
        self.next_join_order += 1;
        let mut peer = Peer::new(peer_id, display_name, order);
        peer.state = PeerState::Active;
        self.peers.insert(peer_id.to_string(), peer);
        Ok(())
    }

    /// Promotes a pending peer to Active. Returns its display name for the
    /// peerJoined broadcast.
    pub fn approve(&mut self, peer_id: &str) -> Result<String, SessionError> {
        let idx = self
            .pending
            .iter()
            .position(|p| p.peer_id == peer_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;
        let entry = self.pending.remove(idx);
        self.admit(&entry.peer_id, &entry.display_name)?;
        Ok(entry.display_name)
    }

    /// Drops a pending join request. Nothing was allocated for it.
    pub fn deny(&mut self, peer_id: &str) -> Result<PendingJoin, SessionError> {
        let idx = self
            .pending
            .iter()
            .position(|p| p.peer_id == peer_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;
        Ok(self.pending.remove(idx))
    }

    /// Takes all still-pending join requests (used when the room dies).
    pub fn drain_pending(&mut self) -> Vec<PendingJoin> {
        std::mem::take(&mut self.pending)
    }

    /// Removes a peer and everything it owns. Idempotent: removing an
    /// unknown or already-left peer returns `None` and changes nothing.
    pub fn remove_peer(&mut self, peer_id: &str) -> Option<PeerTeardown> {
        let mut peer = self.peers.remove(peer_id)?;
        peer.state = PeerState::Left;

        let closed_producers: Vec<String> =
            peer.producers.values().map(|p| p.id.clone()).collect();
        let closed_transports: Vec<String> = peer
            .send_transport
            .iter()
            .chain(peer.recv_transport.iter())
            .map(|t| t.id.clone())
            .collect();

        // Cascade: other peers' consumers of this peer's producers are gone.
        let closed_set: HashSet<&str> = closed_producers.iter().map(String::as_str).collect();
        for other in self.peers.values_mut() {
            other
                .consumers
                .retain(|_, c| !closed_set.contains(c.producer_id.as_str()));
        }

        // Host succession: earliest-joined remaining Active peer takes over
        // so pending approvals are never stranded.
        let mut host_passed_to = None;
        if self.host_peer.as_deref() == Some(peer_id) {
            self.host_peer = self
                .peers
                .values()
                .filter(|p| p.state == PeerState::Active)
                .min_by_key(|p| p.join_order)
                .map(|p| p.id.clone());
            host_passed_to = self.host_peer.clone();
        }

        Some(PeerTeardown {
            display_name: peer.display_name,
            closed_producers,
            closed_transports,
            host_passed_to,
        })
    }

    // --- Transport reservation: reserve under the lock, call the engine
    // without it, re-acquire to commit or roll back. ---

    pub fn reserve_transport(&mut self, peer_id: &str, consuming: bool) -> Result<(), SessionError> {
        let peer = self.active_peer_mut(peer_id)?;
        if consuming {
            peer.recv_reserved = true;
        } else {
            peer.send_reserved = true;
        }
        Ok(())
    }

    pub fn rollback_transport(&mut self, peer_id: &str, consuming: bool) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if consuming {
                peer.recv_reserved = false;
            } else {
                peer.send_reserved = false;
            }
        }
    }

    /// Commits an engine-created transport. Returns the id of a replaced
    /// transport (browser retry) which the caller must close engine-side.
    /// Fails with `PeerNotFound` if the peer left during the engine call,
    /// in which case the caller must close the new transport instead.
    pub fn commit_transport(
        &mut self,
        peer_id: &str,
        consuming: bool,
        transport: Transport,
    ) -> Result<Option<String>, SessionError> {
        let peer = self.active_peer_mut(peer_id)?;
        let reserved = if consuming {
            std::mem::take(&mut peer.recv_reserved)
        } else {
            std::mem::take(&mut peer.send_reserved)
        };
        if !reserved {
            // Stale completion: the peer left and rejoined between the
            // engine call and this commit.
            return Err(SessionError::TransportNotFound(transport.id));
        }
        let slot = if consuming {
            &mut peer.recv_transport
        } else {
            &mut peer.send_transport
        };
        let replaced = slot.replace(transport).map(|t| t.id);
        Ok(replaced)
    }

    /// Marks a transport's DTLS handshake as completed.
    pub fn transport_connected(
        &mut self,
        peer_id: &str,
        transport_id: &str,
    ) -> Result<(), SessionError> {
        let peer = self.active_peer_mut(peer_id)?;
        let transport = peer
            .send_transport
            .iter_mut()
            .chain(peer.recv_transport.iter_mut())
            .find(|t| t.id == transport_id)
            .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))?;
        transport.connected = true;
        Ok(())
    }

    /// Checks that a transport id belongs to the peer at all (either
    /// direction), without requiring the handshake to have finished.
    pub fn verify_transport(&self, peer_id: &str, transport_id: &str) -> Result<(), SessionError> {
        let peer = self.active_peer(peer_id)?;
        peer.send_transport
            .iter()
            .chain(peer.recv_transport.iter())
            .find(|t| t.id == transport_id)
            .map(|_| ())
            .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))
    }

    /// Checks that a peer may produce on the given transport: the transport
    /// must be its send transport and must have completed the connect
    /// handshake.
    pub fn verify_send_transport(
        &self,
        peer_id: &str,
        transport_id: &str,
    ) -> Result<(), SessionError> {
        let peer = self.active_peer(peer_id)?;
        match &peer.send_transport {
            Some(t) if t.id == transport_id && t.connected => Ok(()),
            _ => Err(SessionError::TransportNotFound(transport_id.to_string())),
        }
    }

    /// Checks that a peer may consume: it needs a connected receive
    /// transport and the producer must still exist in the room.
    pub fn verify_consume(&self, peer_id: &str, producer_id: &str) -> Result<(), SessionError> {
        let peer = self.active_peer(peer_id)?;
        match &peer.recv_transport {
            Some(t) if t.connected => {}
            Some(t) => return Err(SessionError::TransportNotFound(t.id.clone())),
            None => return Err(SessionError::TransportNotFound("recv".to_string())),
        }
        self.find_producer(producer_id)
            .map(|_| ())
            .ok_or_else(|| SessionError::ProducerNotFound(producer_id.to_string()))
    }

    /// Registers a producer, enforcing at most one per (peer, kind).
    /// Returns the id of a replaced producer the caller must close
    /// engine-side and announce as closed.
    pub fn register_producer(
        &mut self,
        peer_id: &str,
        kind: MediaKind,
        producer_id: &str,
    ) -> Result<Option<String>, SessionError> {
        let peer = self.active_peer_mut(peer_id)?;
        let replaced = peer
            .producers
            .insert(
                kind,
                Producer {
                    id: producer_id.to_string(),
                    kind,
                    paused: false,
                },
            )
            .map(|p| p.id);

        if let Some(old_id) = &replaced {
            let old = old_id.clone();
            for other in self.peers.values_mut() {
                other.consumers.retain(|_, c| c.producer_id != old);
            }
        }
        Ok(replaced)
    }

    /// Finds a producer anywhere in the room, returning its owner's id.
    pub fn find_producer(&self, producer_id: &str) -> Option<(&str, &Producer)> {
        self.peers.values().find_map(|peer| {
            peer.producers
                .values()
                .find(|p| p.id == producer_id)
                .map(|p| (peer.id.as_str(), p))
        })
    }

    /// Checks that `peer_id` owns `producer_id`: `Unauthorized` when it
    /// belongs to someone else, `ProducerNotFound` when nobody has it.
    pub fn verify_producer_owner(
        &self,
        peer_id: &str,
        producer_id: &str,
    ) -> Result<(), SessionError> {
        match self.find_producer(producer_id) {
            Some((owner, _)) if owner == peer_id => Ok(()),
            Some(_) => Err(SessionError::Unauthorized(
                "producer belongs to another peer".to_string(),
            )),
            None => Err(SessionError::ProducerNotFound(producer_id.to_string())),
        }
    }

    pub fn set_producer_paused(
        &mut self,
        peer_id: &str,
        producer_id: &str,
        paused: bool,
    ) -> Result<(), SessionError> {
        self.verify_producer_owner(peer_id, producer_id)?;
        if let Some(peer) = self.peers.get_mut(peer_id) {
            if let Some(p) = peer.producers.values_mut().find(|p| p.id == producer_id) {
                p.paused = paused;
            }
        }
        Ok(())
    }

    /// Removes a producer by id regardless of who asked (engine
    /// notifications and the reconcile sweep use this), cascading the
    /// removal of consumers that reference it. Returns the owner's id.
    pub fn remove_producer_by_id(&mut self, producer_id: &str) -> Option<(String, MediaKind)> {
        let (owner, kind) = self.peers.values().find_map(|peer| {
            peer.producers
                .values()
                .find(|p| p.id == producer_id)
                .map(|p| (peer.id.clone(), p.kind))
        })?;

        if let Some(peer) = self.peers.get_mut(&owner) {
            peer.producers.retain(|_, p| p.id != producer_id);
        }
        for peer in self.peers.values_mut() {
            peer.consumers.retain(|_, c| c.producer_id != producer_id);
        }
        Some((owner, kind))
    }

    /// Drops local producers the engine no longer reports. Returns the
    /// removed (owner, producer id) pairs for producerClosed broadcasts.
    pub fn drop_stale_producers(&mut self, live: &HashSet<String>) -> Vec<(String, String)> {
        let stale: Vec<(String, String)> = self
            .peers
            .values()
            .flat_map(|peer| {
                peer.producers
                    .values()
                    .filter(|p| !live.contains(&p.id))
                    .map(|p| (peer.id.clone(), p.id.clone()))
            })
            .collect();
        for (owner, producer_id) in &stale {
            if let Some(peer) = self.peers.get_mut(owner) {
                peer.producers.retain(|_, p| &p.id != producer_id);
            }
            for peer in self.peers.values_mut() {
                peer.consumers.retain(|_, c| &c.producer_id != producer_id);
            }
        }
        stale
    }

    pub fn register_consumer(
        &mut self,
        peer_id: &str,
        consumer: Consumer,
    ) -> Result<(), SessionError> {
        let peer = self.active_peer_mut(peer_id)?;
        peer.consumers.insert(consumer.id.clone(), consumer);
        Ok(())
    }

    pub fn verify_consumer_owner(
        &self,
        peer_id: &str,
        consumer_id: &str,
    ) -> Result<(), SessionError> {
        let peer = self.active_peer(peer_id)?;
        if peer.consumers.contains_key(consumer_id) {
            Ok(())
        } else {
            Err(SessionError::ConsumerNotFound(consumer_id.to_string()))
        }
    }

    pub fn resume_consumer(&mut self, peer_id: &str, consumer_id: &str) -> Result<(), SessionError> {
        let peer = self.active_peer_mut(peer_id)?;
        let consumer = peer
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SessionError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer.paused = false;
        Ok(())
    }

    /// All producers in the room except those owned by `excluding`.
    pub fn list_producers(&self, excluding: Option<&str>) -> Vec<ProducerInfo> {
        let mut peers: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| Some(p.id.as_str()) != excluding)
            .collect();
        peers.sort_by_key(|p| p.join_order);
        peers
            .iter()
            .flat_map(|peer| {
                peer.producers.values().map(|p| ProducerInfo {
                    producer_id: p.id.clone(),
                    peer_id: peer.id.clone(),
                    kind: p.kind,
                    paused: p.paused,
                })
            })
            .collect()
    }

    pub fn producer_count(&self) -> usize {
        self.peers.values().map(|p| p.producers.len()).sum()
    }

    /// Room membership in join order, with each peer's live producers —
    /// what a newly admitted peer needs to reconcile against.
    pub fn peer_infos(&self, excluding: Option<&str>) -> Vec<PeerInfo> {
        let mut peers: Vec<&Peer> = self
            .peers
            .values()
            .filter(|p| Some(p.id.as_str()) != excluding)
            .collect();
        peers.sort_by_key(|p| p.join_order);
        peers
            .iter()
            .map(|peer| PeerInfo {
                peer_id: peer.id.clone(),
                display_name: peer.display_name.clone(),
                producers: peer
                    .producers
                    .values()
                    .map(|p| ProducerInfo {
                        producer_id: p.id.clone(),
                        peer_id: peer.id.clone(),
                        kind: p.kind,
                        paused: p.paused,
                    })
                    .collect(),
            })
            .collect()
    }

    fn active_peer(&self, peer_id: &str) -> Result<&Peer, SessionError> {
        self.peers
            .get(peer_id)
            .filter(|p| p.state == PeerState::Active)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))
    }

    fn active_peer_mut(&mut self, peer_id: &str) -> Result<&mut Peer, SessionError> {
        self.peers
            .get_mut(peer_id)
            .filter(|p| p.state == PeerState::Active)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))
    }
}
