//! Binary envelope shared by sessions and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │ checksum │
//! │ 1 byte   │ 16 bytes  │ len+utf8 │ varint   │ variable │ 8 bytes  │
//! └──────────┴───────────┴──────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `checksum` is the first 8 bytes of the blake3 hash of `payload`. Frames
//! whose payload does not match are rejected by [`SyncMessage::decode`], so
//! damaged update bytes never reach the yrs decoder.
//!
//! Two logical channels share one connection: document sync
//! (`SyncStep1`, `SyncStep2`, `Update`) and presence (`Awareness`, `Leave`).
//!
//! Handshake on every (re)connect:
//! ```text
//! client                         relay
//!   │── Join(profile) ──────────►│
//!   │── SyncStep1(client sv) ───►│
//!   │◄────────── SyncStep2(diff) ─│
//!   │◄───── SyncStep1(relay sv) ──│
//!   │── SyncStep2(offline diff) ►│──► Update to other peers
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::UserProfile;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer announces itself and the room it wants
    Join = 1,
    /// yrs state vector, asks the other side for what we miss
    SyncStep1 = 2,
    /// yrs diff answering a SyncStep1
    SyncStep2 = 3,
    /// Incremental yrs update
    Update = 4,
    /// Serialized presence message
    Awareness = 5,
    /// Peer left the room
    Leave = 6,
    /// Keepalive ping
    Ping = 7,
    /// Keepalive pong
    Pong = 8,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Per-peer send counter, informational only
    pub clock: u64,
    pub payload: Vec<u8>,
}

const CHECKSUM_LEN: usize = 8;

/// Outgoing frame, borrowed from a `SyncMessage`.
#[derive(Serialize)]
struct FrameRef<'a> {
    msg_type: MessageType,
    peer_id: Uuid,
    doc_id: &'a str,
    clock: u64,
    payload: &'a [u8],
    checksum: [u8; CHECKSUM_LEN],
}

/// Incoming frame before its checksum is verified.
#[derive(Deserialize)]
struct Frame {
    msg_type: MessageType,
    peer_id: Uuid,
    doc_id: String,
    clock: u64,
    payload: Vec<u8>,
    checksum: [u8; CHECKSUM_LEN],
}

fn payload_checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = blake3::hash(payload);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&hash.as_bytes()[..CHECKSUM_LEN]);
    out
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            clock,
            payload,
        }
    }

    /// Room join carrying the peer's profile.
    pub fn join(peer_id: Uuid, doc_id: &str, profile: &UserProfile) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(profile, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::Join, peer_id, doc_id, 0, payload))
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, 0, diff)
    }

    pub fn update(peer_id: Uuid, doc_id: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, doc_id, clock, update)
    }

    /// Awareness frame; `payload` is an already-encoded `AwarenessMessage`.
    pub fn awareness(peer_id: Uuid, doc_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, peer_id, doc_id, clock, payload)
    }

    pub fn leave(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::Leave, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format, stamping the payload checksum.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let frame = FrameRef {
            msg_type: self.msg_type,
            peer_id: self.peer_id,
            doc_id: &self.doc_id,
            clock: self.clock,
            payload: &self.payload,
            checksum: payload_checksum(&self.payload),
        };
        bincode::serde::encode_to_vec(&frame, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format and verify the payload checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _): (Frame, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if payload_checksum(&frame.payload) != frame.checksum {
            return Err(ProtocolError::ChecksumMismatch);
        }
        Ok(Self {
            msg_type: frame.msg_type,
            peer_id: frame.peer_id,
            doc_id: frame.doc_id,
            clock: frame.clock,
            payload: frame.payload,
        })
    }

    /// Parse the profile carried by a `Join`.
    pub fn profile(&self) -> Result<UserProfile, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (profile, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(profile)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    /// Payload does not match the frame checksum
    ChecksumMismatch,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ChecksumMismatch => write!(f, "Payload checksum mismatch"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
