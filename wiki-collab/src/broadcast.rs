//! Fan-out of relay frames to the other peers of a room.
//!
//! One tokio broadcast channel per room; each peer holds a receiver that
//! buffers up to `capacity` frames. Frames carry their sender so a
//! connection can skip its own without decoding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::awareness::UserProfile;
use crate::protocol::{ProtocolError, SyncMessage};

/// Encoded frame plus the peer it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// Counters kept outside the peer lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

/// Broadcast group for one document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<Uuid, UserProfile>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, peer_id: Uuid, profile: UserProfile) -> broadcast::Receiver<Envelope> {
        self.peers.write().await.insert(peer_id, profile);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<UserProfile> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and send to every subscriber; returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(msg.peer_id, bytes))
    }

    /// Send already-encoded bytes.
    pub fn broadcast_raw(&self, from: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Envelope { from, bytes }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver fell behind by `n` frames.
    pub fn record_lag(&self, n: u64) {
        self.stats.messages_lagged.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<UserProfile> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.stats.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
