//! # wiki-collab: real-time sync for wiki pages
//!
//! Connects a [`wiki_core::ReplicatedDocument`] to other editors through a
//! WebSocket relay, tracks who else is on the page, and keeps a durable
//! snapshot up to date.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐    WebSocket     ┌─────────────┐
//! │ EditingSession     │ ◄──────────────► │ SyncRelay   │
//! │  ReplicatedDocument│   Binary Proto   │ (per room)  │
//! │  SyncTransport     │                  └──────┬──────┘
//! │  AwarenessChannel  │                         │
//! │  Reconciler ───────┼──► SnapshotStore  ┌─────┴─────────┐
//! └────────────────────┘                   │ BroadcastGroup│
//!                                          └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode envelope shared by sessions and relay
//! - [`transport`]: reconnecting connection task with backoff
//! - [`awareness`]: presence map, heartbeats and expiry
//! - [`reconcile`]: bootstrap, debounced and forced snapshot writes
//! - [`session`]: owns all of the above for one open page
//! - [`storage`]: snapshot store trait, in-memory and RocksDB backends
//! - [`relay`] / [`broadcast`]: the relay server

pub mod awareness;
pub mod broadcast;
pub mod protocol;
pub mod reconcile;
pub mod relay;
pub mod session;
pub mod storage;
pub mod transport;

pub use awareness::{
    color_for, AwarenessChannel, AwarenessConfig, AwarenessMessage, AwarenessState,
    CursorSelection, PresenceEntry, UserProfile,
};
pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use reconcile::{BootstrapOutcome, FlushReason, PersistOutcome, ReconcileConfig, Reconciler};
pub use relay::{RelayConfig, RelayStats, SyncRelay};
pub use session::{EditingSession, SessionConfig, SessionError, SessionEvent, SyncInfo};
pub use storage::{
    MemorySnapshotStore, RocksSnapshotStore, Snapshot, SnapshotContent, SnapshotMetadata,
    SnapshotStore, StoreConfig, StoreError,
};
pub use transport::{ConnectionStatus, SyncTransport, TransportConfig, TransportEvent};
