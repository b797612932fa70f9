//! Fan-out broadcast to the connections of one room, with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; frames carry their origin so a connection never
//! receives its own traffic back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, Mutex, RwLock};

use crate::config::CollabConfig;
use crate::error::{ProtocolError, ReplicaError};
use crate::protocol::{RoomKey, SyncMessage};
use crate::replica::{DocumentId, MergeOutcome, Operation, ReplicaId, ReplicaStore, StateVector};

/// Relay-assigned id of one WebSocket connection.
pub type ConnectionId = u64;

/// Origin of frames the relay sends on its own behalf. Never assigned to a
/// connection, so every peer receives them.
pub const RELAY_ORIGIN: ConnectionId = 0;

/// Operations folded into a room replica per lock hold.
const MERGE_CHUNK: usize = 1024;

/// Encoded frame plus the connection it came from.
#[derive(Debug)]
pub struct Frame {
    pub origin: ConnectionId,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    /// Connected peers and the awareness client each one announced.
    peers: RwLock<HashMap<ConnectionId, Option<ReplicaId>>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow peer may fall behind before
    /// it starts missing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    pub async fn add_peer(&self, connection: ConnectionId) -> broadcast::Receiver<Arc<Frame>> {
        let mut peers = self.peers.write().await;
        peers.insert(connection, None);
        self.sender.subscribe()
    }

    /// Remove a connection. Returns the awareness client it carried, if any.
    pub async fn remove_peer(&self, connection: ConnectionId) -> Option<ReplicaId> {
        let mut peers = self.peers.write().await;
        peers.remove(&connection).flatten()
    }

    /// Remember which awareness client speaks through `connection`.
    pub async fn set_awareness_client(&self, connection: ConnectionId, client: Option<ReplicaId>) {
        if let Some(slot) = self.peers.write().await.get_mut(&connection) {
            *slot = client;
        }
    }

    /// Encode and broadcast. Returns the number of receivers.
    pub fn broadcast(&self, origin: ConnectionId, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(origin, msg.encode()?))
    }

    /// Broadcast already-encoded bytes.
    pub fn broadcast_raw(&self, origin: ConnectionId, bytes: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Frame { origin, bytes }))
            .unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, connection: ConnectionId) -> bool {
        self.peers.read().await.contains_key(&connection)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What folding a client batch into a room replica did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomMerge {
    pub outcome: MergeOutcome,
    /// Buffered operations were discarded; peers should resend what the
    /// relay lacks.
    pub needs_refill: bool,
}

impl RoomMerge {
    fn absorb(&mut self, outcome: MergeOutcome) {
        self.outcome.applied += outcome.applied;
        self.outcome.dropped += outcome.dropped;
    }
}

/// One document room on the relay: a replica of the document plus the
/// connections editing it.
pub struct Room {
    key: RoomKey,
    replica: Mutex<ReplicaStore>,
    group: BroadcastGroup,
}

impl Room {
    fn new(key: RoomKey, capacity: usize) -> Self {
        Self::with_config(key, capacity, &CollabConfig::default())
    }

    fn with_config(key: RoomKey, capacity: usize, config: &CollabConfig) -> Self {
        let document_id = DocumentId::new(key.as_str());
        Self {
            replica: Mutex::new(ReplicaStore::with_config(document_id, ReplicaId::random(), config)),
            key,
            group: BroadcastGroup::new(capacity),
        }
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    /// Id the relay signs its own frames with.
    pub async fn replica_id(&self) -> ReplicaId {
        self.replica.lock().await.replica_id()
    }

    /// Operations `remote` lacks, plus the relay's state vector.
    pub async fn diff(&self, remote: &StateVector) -> (ReplicaId, Vec<Operation>, StateVector) {
        let replica = self.replica.lock().await;
        (
            replica.replica_id(),
            replica.diff_since(remote),
            replica.state_vector().clone(),
        )
    }

    /// Fold client operations into the relay replica, a chunk at a time.
    ///
    /// Operations that can never apply are rejected. When buffered
    /// operations overflow or outlive the causal-gap window they are
    /// discarded and the result asks for a refill from the live peers.
    pub async fn merge(&self, operations: Vec<Operation>) -> RoomMerge {
        let mut merged = RoomMerge::default();
        for chunk in operations.chunks(MERGE_CHUNK) {
            {
                let mut replica = self.replica.lock().await;
                let now = Instant::now();
                match replica.merge_remote(chunk.iter().copied(), now) {
                    Ok(outcome) => merged.absorb(outcome),
                    Err(e) => merged.needs_refill |= self.recover(&mut replica, e),
                }
                if let Err(e) = replica.expire_pending(now) {
                    merged.needs_refill |= self.recover(&mut replica, e);
                }
                merged.outcome.pending = replica.pending_len();
            }
            if chunk.len() == MERGE_CHUNK {
                tokio::task::yield_now().await;
            }
        }
        merged
    }

    /// Drop buffered operations that waited too long. Returns whether a
    /// refill should be requested.
    pub async fn expire_pending(&self) -> bool {
        let mut replica = self.replica.lock().await;
        match replica.expire_pending(Instant::now()) {
            Ok(()) => false,
            Err(e) => self.recover(&mut replica, e),
        }
    }

    /// Keep the replica serving after a merge error. Returns whether
    /// operations were discarded.
    fn recover(&self, replica: &mut ReplicaStore, error: ReplicaError) -> bool {
        match error {
            ReplicaError::UnresolvableDependency { .. } => {
                log::warn!("Room {}: rejected operation: {error}", self.key);
                false
            }
            _ => {
                let discarded = replica.discard_pending();
                log::warn!(
                    "Room {}: {error}; discarded {discarded} buffered operations",
                    self.key
                );
                true
            }
        }
    }

    /// Ask every peer for the operations the relay replica lacks.
    pub async fn request_refill(&self) -> Result<usize, ProtocolError> {
        let request = {
            let replica = self.replica.lock().await;
            SyncMessage::sync_request(replica.replica_id(), replica.state_vector())?
        };
        log::info!("Room {}: requesting refill from peers", self.key);
        self.group.broadcast(RELAY_ORIGIN, &request)
    }

    pub async fn text(&self) -> String {
        self.replica.lock().await.text().to_string()
    }
}

/// Room manager: maps room keys to rooms.
///
/// Each document gets its own room so that traffic is isolated between
/// different documents.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomKey, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, key: &RoomKey) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(key) {
            return room.clone();
        }

        log::info!("Room {key} created");
        let room = Arc::new(Room::new(key.clone(), self.default_capacity));
        rooms.insert(key.clone(), room.clone());
        room
    }

    pub async fn get(&self, key: &RoomKey) -> Option<Arc<Room>> {
        self.rooms.read().await.get(key).cloned()
    }

    /// Drop a room nobody is connected to.
    pub async fn remove_if_empty(&self, key: &RoomKey) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            if room.group.peer_count().await == 0 {
                rooms.remove(key);
                log::info!("Room {key} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomKey> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
