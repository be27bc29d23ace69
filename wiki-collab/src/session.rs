//! One user editing one document.
//!
//! `EditingSession` exclusively owns the replicated document, the transport,
//! the presence channel and the reconciler. Everything asynchronous funnels
//! through [`EditingSession::next_event`], a single dispatcher the host polls
//! from its event loop:
//!
//! ```text
//!            ┌──────────── transport events (status, frames)
//! next_event ┼──────────── heartbeat tick (presence publish + expiry)
//!            ├──────────── throttled cursor deadline (trailing presence publish)
//!            ├──────────── debounce deadline (spawn snapshot write)
//!            └──────────── completed writes
//! ```
//!
//! Teardown happens in [`EditingSession::close`]; dropping the session
//! without closing still aborts the connection task.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use wiki_core::{Attributes, DocumentError, ReplicatedDocument, TextRun};

use crate::awareness::{
    AwarenessChannel, AwarenessConfig, AwarenessMessage, CursorSelection, PresenceEntry, UserProfile,
};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::reconcile::{BootstrapOutcome, FlushReason, PersistOutcome, ReconcileConfig, Reconciler};
use crate::storage::{SnapshotStore, StoreError};
use crate::transport::{ConnectionStatus, SyncTransport, TransportConfig, TransportEvent};

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay base URL, e.g. `ws://127.0.0.1:9090`
    pub endpoint: String,
    pub document_id: String,
    pub user: UserProfile,
    pub transport: TransportConfig,
    pub awareness: AwarenessConfig,
    pub reconcile: ReconcileConfig,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>, document_id: impl Into<String>, user: UserProfile) -> Self {
        Self {
            endpoint: endpoint.into(),
            document_id: document_id.into(),
            user,
            transport: TransportConfig::default(),
            awareness: AwarenessConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }

    /// Short timers for tests.
    pub fn for_testing(endpoint: impl Into<String>, document_id: impl Into<String>, user: UserProfile) -> Self {
        Self {
            transport: TransportConfig::for_testing(),
            awareness: AwarenessConfig::for_testing(),
            reconcile: ReconcileConfig::for_testing(),
            ..Self::new(endpoint, document_id, user)
        }
    }
}

/// What the host should react to.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    /// A remote merge changed the document
    ContentChanged,
    PresenceChanged(Vec<PresenceEntry>),
    Bootstrapped(BootstrapOutcome),
    /// Snapshot could not be read; retried on the next connection
    BootstrapFailed(StoreError),
    Persisted { reason: FlushReason, character_count: u32 },
    PersistFailed { reason: FlushReason, error: StoreError },
    /// A remote update or state vector was refused; content untouched
    MergeRejected(DocumentError),
}

/// Connection facts for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInfo {
    pub document_id: String,
    pub status: ConnectionStatus,
    /// Relay state vector from the most recent handshake
    pub last_known_state_vector: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum SessionError {
    Document(DocumentError),
    Store(StoreError),
    Protocol(ProtocolError),
    /// Connection task is gone
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Document(e) => write!(f, "Document error: {e}"),
            SessionError::Store(e) => write!(f, "Store error: {e}"),
            SessionError::Protocol(e) => write!(f, "Protocol error: {e}"),
            SessionError::Closed => write!(f, "Session closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        SessionError::Document(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

enum Wake {
    Transport(Option<TransportEvent>),
    Heartbeat,
    Cursor,
    Debounce,
    Persisted(Option<PersistOutcome>),
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct EditingSession {
    document_id: String,
    client_id: Uuid,
    user: UserProfile,
    doc: ReplicatedDocument,
    transport: SyncTransport,
    awareness: AwarenessChannel,
    reconciler: Reconciler,
    heartbeat: Interval,
    status: ConnectionStatus,
    clock: u64,
    remote_vector: Option<Vec<u8>>,
    pending: VecDeque<SessionEvent>,
}

impl EditingSession {
    /// Create the document and start connecting. Must run inside a tokio runtime.
    pub fn open(config: SessionConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let client_id = Uuid::new_v4();
        let SessionConfig {
            endpoint,
            document_id,
            user,
            transport,
            awareness,
            reconcile,
        } = config;

        let mut heartbeat = tokio::time::interval(awareness.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "Opening session {client_id} on {document_id} as {} via {endpoint}",
            user.name
        );

        Self {
            doc: ReplicatedDocument::new(document_id.clone()),
            transport: SyncTransport::connect(&endpoint, &document_id, client_id, transport),
            awareness: AwarenessChannel::new(client_id, user.clone(), awareness),
            reconciler: Reconciler::new(document_id.clone(), store, reconcile),
            document_id,
            client_id,
            user,
            heartbeat,
            status: ConnectionStatus::Connecting,
            clock: 0,
            remote_vector: None,
            pending: VecDeque::new(),
        }
    }

    // ─── Dispatcher ───────────────────────────────────────────────────

    /// Wait for the next thing the host should know about.
    pub async fn next_event(&mut self) -> Result<SessionEvent, SessionError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }

            let deadline = self.reconciler.deadline();
            let cursor_deadline = self.awareness.cursor_deadline().map(Instant::from_std);
            let wake = tokio::select! {
                evt = self.transport.next_event() => Wake::Transport(evt),
                _ = self.heartbeat.tick() => Wake::Heartbeat,
                _ = sleep_until_deadline(cursor_deadline) => Wake::Cursor,
                _ = sleep_until_deadline(deadline) => Wake::Debounce,
                outcome = self.reconciler.next_outcome() => Wake::Persisted(outcome),
            };

            match wake {
                Wake::Transport(None) => return Err(SessionError::Closed),
                Wake::Transport(Some(TransportEvent::Status(status))) => self.on_status(status),
                Wake::Transport(Some(TransportEvent::Message(msg))) => self.on_message(msg).await,
                Wake::Heartbeat => self.on_heartbeat(),
                Wake::Cursor => {
                    if let Some(msg) = self.awareness.flush_cursor(Instant::now().into_std()) {
                        self.send_awareness(&msg);
                    }
                }
                Wake::Debounce => {
                    self.reconciler.fire_due(&self.doc, Instant::now());
                }
                Wake::Persisted(Some(outcome)) => self.pending.push_back(match outcome.result {
                    Ok(()) => SessionEvent::Persisted {
                        reason: outcome.reason,
                        character_count: outcome.character_count,
                    },
                    Err(error) => SessionEvent::PersistFailed {
                        reason: outcome.reason,
                        error,
                    },
                }),
                Wake::Persisted(None) => {}
            }
        }
    }

    fn on_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.pending.push_back(SessionEvent::Status(status));

        match status {
            ConnectionStatus::Connected => {
                log::info!("Session {} connected, starting handshake", self.client_id);
                match SyncMessage::join(self.client_id, &self.document_id, &self.user) {
                    Ok(join) => {
                        self.send(join);
                    }
                    Err(e) => log::error!("Failed to encode join for {}: {e}", self.document_id),
                }
                self.send(SyncMessage::sync_step1(
                    self.client_id,
                    &self.document_id,
                    self.doc.encoded_state_vector(),
                ));
                let hello = self.awareness.force_publish(Instant::now().into_std());
                self.send_awareness(&hello);
            }
            ConnectionStatus::Disconnected => {
                if self.awareness.clear_remote() > 0 {
                    self.refresh_presence();
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    async fn on_message(&mut self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::SyncStep2 => {
                self.merge(&msg.payload);
                if !self.reconciler.is_bootstrapped() {
                    self.run_bootstrap().await;
                }
            }
            MessageType::Update => self.merge(&msg.payload),
            MessageType::SyncStep1 => match self.doc.compute_local_update(&msg.payload) {
                Ok(diff) => {
                    self.remote_vector = Some(msg.payload);
                    log::debug!("Sending {} byte catch-up diff", diff.len());
                    self.send(SyncMessage::sync_step2(self.client_id, &self.document_id, diff));
                }
                Err(e) => {
                    log::warn!("Relay sent unusable state vector: {e}");
                    self.pending.push_back(SessionEvent::MergeRejected(e));
                }
            },
            MessageType::Awareness => match AwarenessMessage::decode(&msg.payload) {
                Ok(presence) => {
                    self.awareness.handle_message(&presence, Instant::now().into_std());
                    self.refresh_presence();
                }
                Err(e) => log::warn!("Dropping presence frame from {}: {e}", msg.peer_id),
            },
            MessageType::Leave => {
                if self.awareness.remove_peer(&msg.peer_id) {
                    self.refresh_presence();
                }
            }
            MessageType::Join | MessageType::Ping | MessageType::Pong => {}
        }
    }

    fn merge(&mut self, update: &[u8]) {
        match self.doc.apply_remote_update(update) {
            Ok(changed) => {
                if changed {
                    self.pending.push_back(SessionEvent::ContentChanged);
                }
            }
            Err(e) => {
                log::warn!("Rejected remote update for {}: {e}", self.document_id);
                self.pending.push_back(SessionEvent::MergeRejected(e));
            }
        }
    }

    async fn run_bootstrap(&mut self) {
        match self.reconciler.bootstrap(&mut self.doc).await {
            Ok(outcome) => {
                if let BootstrapOutcome::Imported { update } = &outcome {
                    self.broadcast_update(update.clone());
                    self.pending.push_back(SessionEvent::ContentChanged);
                }
                self.pending.push_back(SessionEvent::Bootstrapped(outcome));
            }
            Err(e) => {
                log::warn!("Snapshot read for {} failed: {e}", self.document_id);
                self.pending.push_back(SessionEvent::BootstrapFailed(e));
            }
        }
    }

    fn on_heartbeat(&mut self) {
        if self.status == ConnectionStatus::Connected {
            let beat = self.awareness.heartbeat();
            self.send_awareness(&beat);
        }
        self.refresh_presence();
    }

    fn refresh_presence(&mut self) {
        if let Some(list) = self.awareness.recompute(Instant::now().into_std()) {
            self.pending.push_back(SessionEvent::PresenceChanged(list));
        }
    }

    fn send(&self, msg: SyncMessage) -> bool {
        self.transport.send(&msg)
    }

    fn send_awareness(&mut self, presence: &AwarenessMessage) {
        match presence.encode() {
            Ok(payload) => {
                self.clock += 1;
                self.send(SyncMessage::awareness(
                    self.client_id,
                    &self.document_id,
                    self.clock,
                    payload,
                ));
            }
            Err(e) => log::error!("Failed to encode presence: {e}"),
        }
    }

    fn broadcast_update(&mut self, update: Vec<u8>) {
        self.clock += 1;
        self.send(SyncMessage::update(self.client_id, &self.document_id, self.clock, update));
    }

    fn after_local_edit(&mut self, update: Vec<u8>) {
        self.reconciler.note_content_change(Instant::now());
        self.broadcast_update(update);
    }

    // ─── Editing ──────────────────────────────────────────────────────

    pub fn insert(&mut self, index: u32, text: &str) -> Result<(), SessionError> {
        let update = self.doc.insert(index, text)?;
        self.after_local_edit(update);
        Ok(())
    }

    pub fn insert_formatted(&mut self, index: u32, text: &str, attributes: &Attributes) -> Result<(), SessionError> {
        let update = self.doc.insert_formatted(index, text, attributes)?;
        self.after_local_edit(update);
        Ok(())
    }

    pub fn push(&mut self, text: &str) {
        let update = self.doc.push(text);
        self.after_local_edit(update);
    }

    pub fn format(&mut self, index: u32, len: u32, attributes: &Attributes) -> Result<(), SessionError> {
        let update = self.doc.format(index, len, attributes)?;
        self.after_local_edit(update);
        Ok(())
    }

    pub fn remove(&mut self, index: u32, len: u32) -> Result<(), SessionError> {
        let update = self.doc.remove(index, len)?;
        self.after_local_edit(update);
        Ok(())
    }

    pub fn replace_all(&mut self, text: &str) {
        let update = self.doc.replace_all(text);
        self.after_local_edit(update);
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.reconciler.note_title_change(title, Instant::now());
    }

    pub fn set_cursor(&mut self, cursor: Option<CursorSelection>) {
        if let Some(msg) = self.awareness.set_cursor(cursor, Instant::now().into_std()) {
            self.send_awareness(&msg);
        }
    }

    // ─── Forced flushes ───────────────────────────────────────────────

    /// Explicit save (keyboard shortcut).
    pub async fn save(&mut self) -> Result<(), SessionError> {
        self.reconciler.flush(&self.doc, FlushReason::Explicit).await?;
        Ok(())
    }

    /// The window was hidden; persist now in case it never comes back.
    pub async fn visibility_lost(&mut self) -> Result<(), SessionError> {
        self.reconciler.flush(&self.doc, FlushReason::Hidden).await?;
        Ok(())
    }

    /// Flush, announce departure, disconnect and release the document.
    ///
    /// Every step runs even when the flush fails; its error is returned last.
    pub async fn close(mut self) -> Result<(), SessionError> {
        let flushed = self.reconciler.flush(&self.doc, FlushReason::Closing).await;

        if self.status == ConnectionStatus::Connected {
            let leave = self.awareness.leave_message();
            self.send_awareness(&leave);
        }

        let EditingSession {
            client_id,
            doc,
            transport,
            heartbeat,
            ..
        } = self;

        transport.disconnect().await;
        drop(heartbeat);
        doc.destroy();
        log::info!("Session {client_id} closed");

        flushed.map_err(SessionError::from)
    }

    // ─── Inspection ───────────────────────────────────────────────────

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn document(&self) -> &ReplicatedDocument {
        &self.doc
    }

    pub fn content(&self) -> String {
        self.doc.content()
    }

    pub fn runs(&self) -> Vec<TextRun> {
        self.doc.runs()
    }

    /// For the status bar.
    pub fn character_count(&self) -> usize {
        self.doc.character_count()
    }

    pub fn title(&self) -> Option<&str> {
        self.reconciler.title()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// "Syncing" indicator.
    pub fn is_syncing(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.subscribe_status()
    }

    pub fn presence(&self) -> &[PresenceEntry] {
        self.awareness.presence()
    }

    pub fn sync_info(&self) -> SyncInfo {
        SyncInfo {
            document_id: self.document_id.clone(),
            status: self.status,
            last_known_state_vector: self.remote_vector.clone(),
        }
    }
}
