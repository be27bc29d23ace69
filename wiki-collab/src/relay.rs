//! WebSocket relay with one room per document.
//!
//! ```text
//! Session A ──┐
//!             ├── Room (doc_id) ── ReplicatedDocument ── BroadcastGroup
//! Session B ──┘                                              │
//!                                               ┌────────────┼───────────┐
//!                                               ▼            ▼           ▼
//!                                           Session A    Session B   Session C
//! ```
//!
//! Each room keeps an in-memory replica so it can answer the state-vector
//! handshake, plus the last presence frame of every peer so newcomers see
//! who is already there. Rooms live only while they have peers; durable
//! storage is the sessions' business.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use wiki_core::ReplicatedDocument;

use crate::awareness::{AwarenessMessage, UserProfile};
use crate::broadcast::{BroadcastGroup, Envelope};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Joins beyond this are refused
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Updates that failed to decode or merge
    pub rejected_updates: u64,
    pub active_rooms: usize,
}

struct DocumentRoom {
    doc: ReplicatedDocument,
    broadcast: Arc<BroadcastGroup>,
    /// Last presence frame per peer
    presence: HashMap<Uuid, Arc<Vec<u8>>>,
}

impl DocumentRoom {
    fn new(doc_id: &str, capacity: usize) -> Self {
        Self {
            doc: ReplicatedDocument::new(doc_id),
            broadcast: Arc::new(BroadcastGroup::new(capacity)),
            presence: HashMap::new(),
        }
    }
}

type Rooms = Arc<RwLock<HashMap<String, DocumentRoom>>>;

#[derive(Clone)]
struct Shared {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

/// The relay server.
pub struct SyncRelay {
    shared: Shared,
}

impl SyncRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            shared: Shared {
                config,
                rooms: Arc::new(RwLock::new(HashMap::new())),
                stats: Arc::new(RwLock::new(RelayStats::default())),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.read().await.len()
    }

    /// Plain text of a room's replica, if the room exists.
    pub async fn room_content(&self, doc_id: &str) -> Option<String> {
        self.shared.rooms.read().await.get(doc_id).map(|r| r.doc.content())
    }

    pub async fn room_peers(&self, doc_id: &str) -> Vec<UserProfile> {
        let broadcast = {
            let rooms = self.shared.rooms.read().await;
            match rooms.get(doc_id) {
                Some(room) => room.broadcast.clone(),
                None => return Vec::new(),
            }
        };
        broadcast.peers().await
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Shared,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    log::info!("WebSocket connection established from {addr}");
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut conn = PeerConnection {
        addr,
        shared,
        peer_id: None,
        doc_id: None,
        broadcast_rx: None,
    };

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = conn.shared.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                continue;
                            }
                        };
                        let replies = match conn.handle_frame(sync_msg).await {
                            Ok(replies) => replies,
                            Err(e) => {
                                log::warn!("Closing {addr}: {e}");
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        };
                        let mut failed = false;
                        for reply in replies {
                            if ws_sender.send(Message::Binary(reply.into())).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            envelope = recv_broadcast(&mut conn.broadcast_rx) => {
                match envelope {
                    Ok(env) => {
                        if Some(env.from) == conn.peer_id {
                            continue;
                        }
                        if ws_sender.send(Message::Binary(env.bytes.to_vec().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer {:?} lagged by {n} frames, resending state", conn.peer_id);
                        if let Some(resync) = conn.lag_recovery(n).await {
                            if ws_sender.send(Message::Binary(resync.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    conn.cleanup().await;
    Ok(())
}

async fn recv_broadcast(
    rx: &mut Option<broadcast::Receiver<Envelope>>,
) -> Result<Envelope, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Per-connection state.
struct PeerConnection {
    addr: SocketAddr,
    shared: Shared,
    peer_id: Option<Uuid>,
    doc_id: Option<String>,
    broadcast_rx: Option<broadcast::Receiver<Envelope>>,
}

impl PeerConnection {
    /// Handle one inbound frame; returns frames to send back to this peer.
    async fn handle_frame(&mut self, msg: SyncMessage) -> Result<Vec<Vec<u8>>, ProtocolError> {
        match msg.msg_type {
            MessageType::Ping => return Ok(vec![SyncMessage::pong(Uuid::nil()).encode()?]),
            MessageType::Pong => return Ok(Vec::new()),
            MessageType::Join => return self.join(msg).await,
            _ => {}
        }

        let (Some(peer_id), Some(doc_id)) = (self.peer_id, self.doc_id.clone()) else {
            log::debug!("Ignoring {:?} from {} before join", msg.msg_type, self.addr);
            return Ok(Vec::new());
        };
        if msg.doc_id != doc_id {
            log::warn!("Peer {peer_id} sent frame for {} while in {doc_id}", msg.doc_id);
            return Ok(Vec::new());
        }

        let mut rooms = self.shared.rooms.write().await;
        let Some(room) = rooms.get_mut(&doc_id) else {
            return Ok(Vec::new());
        };

        match msg.msg_type {
            MessageType::SyncStep1 => match room.doc.compute_local_update(&msg.payload) {
                Ok(diff) => {
                    log::debug!("Handshake with {peer_id} on {doc_id}: {} byte diff", diff.len());
                    Ok(vec![
                        SyncMessage::sync_step2(Uuid::nil(), &doc_id, diff).encode()?,
                        SyncMessage::sync_step1(Uuid::nil(), &doc_id, room.doc.encoded_state_vector())
                            .encode()?,
                    ])
                }
                Err(e) => {
                    log::warn!("Bad state vector from {peer_id}: {e}");
                    Ok(Vec::new())
                }
            },

            MessageType::SyncStep2 | MessageType::Update => {
                match room.doc.apply_remote_update(&msg.payload) {
                    Ok(_) => {
                        let forward = SyncMessage::update(peer_id, &doc_id, msg.clock, msg.payload);
                        room.broadcast.broadcast(&forward)?;
                    }
                    Err(e) => {
                        log::warn!("Rejected update from {peer_id} on {doc_id}: {e}");
                        drop(rooms);
                        self.shared.stats.write().await.rejected_updates += 1;
                    }
                }
                Ok(Vec::new())
            }

            MessageType::Awareness => {
                match AwarenessMessage::decode(&msg.payload) {
                    Ok(AwarenessMessage::Update { .. }) => {
                        let bytes = Arc::new(msg.encode()?);
                        room.presence.insert(peer_id, bytes.clone());
                        room.broadcast.broadcast_raw(peer_id, bytes);
                    }
                    Ok(AwarenessMessage::Leave { .. }) => {
                        room.presence.remove(&peer_id);
                        room.broadcast.broadcast(&msg)?;
                    }
                    Err(e) => log::warn!("Dropping presence frame from {peer_id}: {e}"),
                }
                Ok(Vec::new())
            }

            MessageType::Leave => {
                room.presence.remove(&peer_id);
                room.broadcast.broadcast(&msg)?;
                Ok(Vec::new())
            }

            _ => {
                log::debug!("Unhandled message type: {:?}", msg.msg_type);
                Ok(Vec::new())
            }
        }
    }

    async fn join(&mut self, msg: SyncMessage) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if self.peer_id.is_some() {
            log::debug!("Duplicate join from {}", self.addr);
            return Ok(Vec::new());
        }

        let profile = msg
            .profile()
            .unwrap_or_else(|_| UserProfile::new(msg.peer_id.to_string(), ""));

        let mut rooms = self.shared.rooms.write().await;
        let capacity = self.shared.config.broadcast_capacity;
        let room = rooms.entry(msg.doc_id.clone()).or_insert_with(|| {
            log::info!("Room {} created", msg.doc_id);
            DocumentRoom::new(&msg.doc_id, capacity)
        });

        if room.broadcast.peer_count().await >= self.shared.config.max_peers_per_room {
            log::warn!("Room {} is full, refusing {}", msg.doc_id, msg.peer_id);
            return Err(ProtocolError::ConnectionClosed);
        }

        let rx = room.broadcast.add_peer(msg.peer_id, profile.clone()).await;
        let presence: Vec<Vec<u8>> = room.presence.values().map(|b| b.to_vec()).collect();
        let room_count = rooms.len();
        drop(rooms);

        self.peer_id = Some(msg.peer_id);
        self.doc_id = Some(msg.doc_id.clone());
        self.broadcast_rx = Some(rx);
        self.shared.stats.write().await.active_rooms = room_count;

        log::info!(
            "Peer {} ({}) joined doc {}",
            profile.name,
            msg.peer_id,
            msg.doc_id
        );
        Ok(presence)
    }

    /// Full state for a peer whose receiver overflowed.
    async fn lag_recovery(&self, n: u64) -> Option<Vec<u8>> {
        let doc_id = self.doc_id.as_deref()?;
        let rooms = self.shared.rooms.read().await;
        let room = rooms.get(doc_id)?;
        room.broadcast.record_lag(n);
        SyncMessage::sync_step2(Uuid::nil(), doc_id, room.doc.encode_state())
            .encode()
            .ok()
    }

    async fn cleanup(&mut self) {
        if let (Some(pid), Some(did)) = (self.peer_id, self.doc_id.as_deref()) {
            let mut rooms = self.shared.rooms.write().await;
            if let Some(room) = rooms.get_mut(did) {
                room.broadcast.remove_peer(&pid).await;
                room.presence.remove(&pid);
                let _ = room.broadcast.broadcast(&SyncMessage::leave(pid, did));

                if room.broadcast.peer_count().await == 0 {
                    rooms.remove(did);
                    log::info!("Room {did} removed (empty)");
                }
            }
            let room_count = rooms.len();
            drop(rooms);
            self.shared.stats.write().await.active_rooms = room_count;
            log::info!("Peer {pid} left doc {did}");
        }

        let mut s = self.shared.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[tokio::test]
    async fn test_relay_starts_empty() {
        let relay = SyncRelay::with_defaults();
        assert_eq!(relay.bind_addr(), "127.0.0.1:9090");
        assert_eq!(relay.room_count().await, 0);
        assert!(relay.room_content("doc").await.is_none());
        assert!(relay.room_peers("doc").await.is_empty());

        let stats = relay.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_frames_before_join_are_ignored() {
        let shared = SyncRelay::with_defaults().shared;
        let mut conn = PeerConnection {
            addr: "127.0.0.1:1".parse().unwrap(),
            shared: shared.clone(),
            peer_id: None,
            doc_id: None,
            broadcast_rx: None,
        };

        let replies = conn
            .handle_frame(SyncMessage::update(Uuid::new_v4(), "doc", 1, vec![0, 0]))
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert!(shared.rooms.read().await.is_empty());

        let pong = conn.handle_frame(SyncMessage::ping(Uuid::new_v4())).await.unwrap();
        assert_eq!(SyncMessage::decode(&pong[0]).unwrap().msg_type, MessageType::Pong);
    }

    #[tokio::test]
    async fn test_join_handshake_and_cleanup() {
        let shared = SyncRelay::with_defaults().shared;
        let peer = Uuid::new_v4();
        let mut conn = PeerConnection {
            addr: "127.0.0.1:1".parse().unwrap(),
            shared: shared.clone(),
            peer_id: None,
            doc_id: None,
            broadcast_rx: None,
        };

        conn.handle_frame(SyncMessage::join(peer, "doc", &UserProfile::new("u", "U")).unwrap())
            .await
            .unwrap();
        assert_eq!(shared.rooms.read().await.len(), 1);

        let empty = ReplicatedDocument::new("doc");
        let replies = conn
            .handle_frame(SyncMessage::sync_step1(peer, "doc", empty.encoded_state_vector()))
            .await
            .unwrap();
        let types: Vec<MessageType> = replies
            .iter()
            .map(|r| SyncMessage::decode(r).unwrap().msg_type)
            .collect();
        assert_eq!(types, vec![MessageType::SyncStep2, MessageType::SyncStep1]);

        // Corrupt update: rejected and counted.
        conn.handle_frame(SyncMessage::update(peer, "doc", 1, vec![0xFF; 8]))
            .await
            .unwrap();
        assert_eq!(shared.stats.read().await.rejected_updates, 1);

        conn.cleanup().await;
        assert!(shared.rooms.read().await.is_empty());
    }
}
