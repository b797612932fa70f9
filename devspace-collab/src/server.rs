//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (codespace-<doc>) ── ReplicaStore ── BroadcastGroup
//! Client B ──┘                                                  │
//!                                                  ┌────────────┼────────────┐
//!                                                  ▼            ▼            ▼
//!                                               Client A     Client B     Client C
//! ```
//!
//! The room key is the URL path of the WebSocket request. Each room keeps
//! a relay-owned replica so a client joining late (or coming back from an
//! outage) can be caught up without any other editor being online. The
//! relay is a plain peer: it never reorders or rewrites operations. When
//! its replica has to discard buffered operations it broadcasts a sync
//! request, and the live peers' answers refill it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{ConnectionId, Room, RoomManager};
use crate::error::ProtocolError;
use crate::protocol::{MessageType, RoomKey, SyncMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    next_connection: Arc<AtomicU64>,
}

/// Shared state handed to each connection task.
#[derive(Clone)]
struct Relay {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            rooms: Arc::new(RoomManager::new(config.broadcast_capacity)),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let relay = Relay {
                config: self.config.clone(),
                rooms: self.rooms.clone(),
                stats: self.stats.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = relay.handle_connection(stream, addr, connection).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

impl Relay {
    async fn handle_connection(
        self,
        stream: TcpStream,
        addr: SocketAddr,
        connection: ConnectionId,
    ) -> Result<(), BoxError> {
        let mut path = String::new();
        let capture_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let key = path.trim_matches('/');
        if key.is_empty() {
            log::warn!("Rejecting {addr}: no room in request path");
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }
        let key = RoomKey::from_raw(key);

        let room = self.rooms.get_or_create(&key).await;
        if room.group().peer_count().await >= self.config.max_peers_per_room {
            log::warn!("Rejecting {addr}: room {key} is full");
            ws_sender.send(Message::Close(None)).await?;
            self.rooms.remove_if_empty(&key).await;
            return Ok(());
        }
        let mut broadcast_rx = room.group().add_peer(connection).await;
        log::info!("Connection {connection} from {addr} joined room {key}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = self.rooms.room_count().await;
        }

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                let sync_msg = match SyncMessage::decode(&data) {
                                    Ok(sync_msg) => sync_msg,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let kind = sync_msg.msg_type;
                                let reply = self
                                    .handle_frame(&room, connection, sync_msg, &data)
                                    .await
                                    .and_then(|reply| reply.map(|msg| msg.encode()).transpose());
                                match reply {
                                    Ok(Some(bytes)) => ws_sender.send(Message::Binary(bytes.into())).await?,
                                    Ok(None) => {}
                                    Err(e) => log::warn!("Dropping {} frame from {addr}: {e}", kind.name()),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    frame = broadcast_rx.recv() => {
                        match frame {
                            Ok(frame) => {
                                // Don't echo back to sender
                                if frame.origin != connection {
                                    ws_sender.send(Message::Binary(frame.bytes.clone().into())).await?;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                // Missed operations would leave a causal gap; make the
                                // client reconnect and resync instead.
                                log::warn!("Connection {connection} lagged by {n} frames, disconnecting");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup: the peers drop this connection's awareness record.
        if let Some(client) = room.group().remove_peer(connection).await {
            let _ = room.group().broadcast(connection, &SyncMessage::leave(client));
        }
        self.rooms.remove_if_empty(&key).await;
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = self.rooms.room_count().await;
        }
        result
    }

    /// Apply one decoded frame. Returns a direct reply, if any.
    async fn handle_frame(
        &self,
        room: &Room,
        connection: ConnectionId,
        sync_msg: SyncMessage,
        raw: &[u8],
    ) -> Result<Option<SyncMessage>, ProtocolError> {
        match sync_msg.msg_type {
            MessageType::SyncRequest => {
                let remote = sync_msg.state_vector()?;
                let (relay_id, missing, state_vector) = room.diff(&remote).await;
                log::debug!(
                    "Room {}: sync request from {}, sending {} operations",
                    room.key(),
                    sync_msg.sender.short(),
                    missing.len()
                );
                SyncMessage::sync_response(relay_id, missing, state_vector).map(Some)
            }

            MessageType::Update => {
                let operations = sync_msg.operations()?;
                let merged = room.merge(operations).await;
                log::trace!(
                    "Room {}: update from {} ({} applied, {} pending)",
                    room.key(),
                    sync_msg.sender.short(),
                    merged.outcome.applied,
                    merged.outcome.pending
                );
                room.group().broadcast_raw(connection, raw.to_vec());
                if merged.needs_refill {
                    room.request_refill().await?;
                }
                Ok(None)
            }

            MessageType::SyncResponse => {
                // Forward a peer's answer to the others as a plain update.
                let operations = sync_msg.operations()?;
                let update = SyncMessage::update(sync_msg.sender, &operations)?;
                let merged = room.merge(operations).await;
                room.group().broadcast(connection, &update)?;
                if merged.needs_refill {
                    room.request_refill().await?;
                }
                Ok(None)
            }

            MessageType::Awareness => {
                let record = sync_msg.awareness_record()?;
                room.group()
                    .set_awareness_client(connection, Some(record.client_id))
                    .await;
                room.group().broadcast_raw(connection, raw.to_vec());
                Ok(None)
            }

            MessageType::Leave => {
                room.group().set_awareness_client(connection, None).await;
                room.group().broadcast_raw(connection, raw.to_vec());
                Ok(None)
            }

            MessageType::Ping => {
                // Heartbeats double as the room's clock for stale buffered operations.
                if room.expire_pending().await {
                    room.request_refill().await?;
                }
                Ok(Some(SyncMessage::pong(room.replica_id().await)))
            }

            MessageType::Pong => Ok(None),
        }
    }
}
