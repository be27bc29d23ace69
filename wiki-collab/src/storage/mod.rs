//! Durable snapshot storage.
//!
//! The editing core only ever reads a snapshot once (to seed an empty
//! document) and writes one on every debounce or forced flush. Stores are
//! treated as eventually consistent: the last completed write wins.
//!
//! ```text
//! ┌──────────────┐  read once   ┌──────────────────────────────┐
//! │ Reconciler   │ ───────────► │ SnapshotStore                │
//! │ (per session)│ ◄─────────── │  MemorySnapshotStore (tests) │
//! └──────────────┘  writes      │  RocksSnapshotStore          │
//!                               │   CF "documents" body+state  │
//!                               │   CF "metadata"  title/count │
//!                               └──────────────────────────────┘
//! ```

pub mod memory;
pub mod rocks;

pub use memory::MemorySnapshotStore;
pub use rocks::{RocksSnapshotStore, StoreConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Stored document content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotContent {
    /// Rendered plain text
    pub body: String,
    /// yrs v1 state; empty for snapshots written by other tools
    pub state: Vec<u8>,
}

impl SnapshotContent {
    /// CRDT state if present.
    pub fn state(&self) -> Option<&[u8]> {
        if self.state.is_empty() {
            None
        } else {
            Some(&self.state)
        }
    }
}

/// Metadata written with each snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// `None` keeps whatever title is already stored
    pub title: Option<String>,
    pub character_count: u32,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl SnapshotMetadata {
    pub fn now(title: Option<String>, character_count: u32) -> Self {
        Self {
            title,
            character_count,
            updated_at: unix_now(),
        }
    }
}

/// A snapshot as returned by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content: SnapshotContent,
    pub metadata: SnapshotMetadata,
}

/// Durable storage collaborator.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored for `document_id`.
    async fn read_snapshot(&self, document_id: &str) -> Result<Option<Snapshot>, StoreError>;

    async fn write_snapshot(
        &self,
        document_id: &str,
        content: &SnapshotContent,
        metadata: &SnapshotMetadata,
    ) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Document not found
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Backend refused or is offline
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
