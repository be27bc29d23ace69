//! Presence channel: who is editing and where their cursor sits.
//!
//! Presence is ephemeral. It never touches the replicated document and has
//! no durability requirement; it rides the same connection as document sync
//! inside `Awareness` frames.
//!
//! ```text
//! heartbeat tick (3s) ──► AwarenessChannel::heartbeat() ──► peers
//! cursor move ──────────► set_cursor()  (throttled)    ──► peers
//! throttle expiry ──────► flush_cursor() (trailing edge) ──► peers
//! peer frame ───────────► handle_message()  (LWW by receipt)
//! heartbeat tick ───────► recompute()  evicts stale, rebuilds presence list
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Shown when a peer publishes no display name.
pub const UNKNOWN_USER_NAME: &str = "Unknown user";
/// Shown when a peer publishes no color.
pub const FALLBACK_COLOR: &str = "#000000";

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Who a participant is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    /// `#rrggbb`
    pub color: String,
}

impl UserProfile {
    /// Build a profile whose color is derived from `id`.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        let color = color_for(&id);
        Self {
            id,
            name: name.into(),
            color,
        }
    }
}

/// Stable, visually distinct color for a user id.
///
/// Hue comes from a blake3 hash of the id, so the same user gets the same
/// color on every device, reconnect and test run.
pub fn color_for(user_id: &str) -> String {
    let hash = blake3::hash(user_id.as_bytes());
    let bytes = hash.as_bytes();
    let hue = u16::from_le_bytes([bytes[0], bytes[1]]) % 360;
    let (r, g, b) = hsl_to_rgb(hue as f32 / 360.0, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Text selection in document offsets. `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorSelection {
    pub anchor: u32,
    pub head: u32,
}

impl CursorSelection {
    pub fn caret(at: u32) -> Self {
        Self { anchor: at, head: at }
    }
}

/// Everything one client publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub client_id: Uuid,
    pub user: UserProfile,
    pub cursor: Option<CursorSelection>,
}

/// One row of the externally visible presence list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl PresenceEntry {
    fn from_state(state: &AwarenessState) -> Self {
        let name = if state.user.name.trim().is_empty() {
            UNKNOWN_USER_NAME.to_string()
        } else {
            state.user.name.clone()
        };
        let color = if state.user.color.is_empty() {
            FALLBACK_COLOR.to_string()
        } else {
            state.user.color.clone()
        };
        Self {
            id: state.user.id.clone(),
            name,
            color,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Presence deltas carried inside `Awareness` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full state of one client (heartbeat or change).
    Update { state: AwarenessState, clock: u64 },
    /// Client is going away on purpose.
    Leave { client_id: Uuid },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn client_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Update { state, .. } => state.client_id,
            AwarenessMessage::Leave { client_id } => *client_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

/// Presence timing.
#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// How often the local state is republished
    pub heartbeat_interval: Duration,
    /// Entries not refreshed within this window are evicted
    pub stale_timeout: Duration,
    /// Minimum gap between two cursor publications
    pub cursor_throttle: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(3),
            stale_timeout: Duration::from_secs(30),
            cursor_throttle: Duration::from_millis(33),
        }
    }
}

impl AwarenessConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            stale_timeout: Duration::from_millis(1000),
            cursor_throttle: Duration::from_millis(0),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerPresence {
    state: AwarenessState,
    last_seen: Instant,
}

/// Presence map for one session.
pub struct AwarenessChannel {
    local: AwarenessState,
    clock: u64,
    peers: HashMap<Uuid, PeerPresence>,
    config: AwarenessConfig,
    last_cursor_publish: Option<Instant>,
    /// A throttled cursor move has not been published yet
    cursor_pending: bool,
    presence: Vec<PresenceEntry>,
    dirty: bool,
}

impl AwarenessChannel {
    pub fn new(client_id: Uuid, user: UserProfile, config: AwarenessConfig) -> Self {
        let local = AwarenessState {
            client_id,
            user,
            cursor: None,
        };
        let presence = vec![PresenceEntry::from_state(&local)];
        Self {
            local,
            clock: 0,
            peers: HashMap::new(),
            config,
            last_cursor_publish: None,
            cursor_pending: false,
            presence,
            dirty: false,
        }
    }

    pub fn client_id(&self) -> Uuid {
        self.local.client_id
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    pub fn config(&self) -> &AwarenessConfig {
        &self.config
    }

    /// Periodic self-publication.
    pub fn heartbeat(&mut self) -> AwarenessMessage {
        self.publish()
    }

    /// Record a cursor move; returns a message unless throttled.
    ///
    /// A throttled move is published later by [`flush_cursor`](Self::flush_cursor)
    /// once [`cursor_deadline`](Self::cursor_deadline) passes.
    pub fn set_cursor(
        &mut self,
        cursor: Option<CursorSelection>,
        now: Instant,
    ) -> Option<AwarenessMessage> {
        self.local.cursor = cursor;

        if let Some(last) = self.last_cursor_publish {
            if now.saturating_duration_since(last) < self.config.cursor_throttle {
                self.cursor_pending = true;
                return None;
            }
        }
        self.last_cursor_publish = Some(now);
        Some(self.publish())
    }

    /// Publish regardless of throttling (e.g. right after connecting).
    pub fn force_publish(&mut self, now: Instant) -> AwarenessMessage {
        self.last_cursor_publish = Some(now);
        self.publish()
    }

    /// When the last throttled cursor move becomes publishable, if one is waiting.
    pub fn cursor_deadline(&self) -> Option<Instant> {
        if !self.cursor_pending {
            return None;
        }
        match self.last_cursor_publish {
            Some(last) => Some(last + self.config.cursor_throttle),
            None => Some(Instant::now()),
        }
    }

    /// Trailing-edge publish of a throttled cursor move.
    pub fn flush_cursor(&mut self, now: Instant) -> Option<AwarenessMessage> {
        let due = self.cursor_deadline()?;
        if now < due {
            return None;
        }
        self.last_cursor_publish = Some(now);
        Some(self.publish())
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            client_id: self.local.client_id,
        }
    }

    fn publish(&mut self) -> AwarenessMessage {
        // Every publication carries the current cursor.
        self.cursor_pending = false;
        self.clock += 1;
        AwarenessMessage::Update {
            state: self.local.clone(),
            clock: self.clock,
        }
    }

    /// Apply a peer's message. Last write wins by receipt.
    pub fn handle_message(&mut self, msg: &AwarenessMessage, now: Instant) {
        if msg.client_id() == self.local.client_id {
            return;
        }

        match msg {
            AwarenessMessage::Update { state, .. } => {
                let known = self.peers.contains_key(&state.client_id);
                if !known {
                    log::debug!("Presence: {} joined", state.user.name);
                }
                self.peers.insert(
                    state.client_id,
                    PeerPresence {
                        state: state.clone(),
                        last_seen: now,
                    },
                );
                self.dirty = true;
            }
            AwarenessMessage::Leave { client_id } => {
                self.remove_peer(client_id);
            }
        }
    }

    /// Drop a peer (explicit leave or relay notification).
    pub fn remove_peer(&mut self, client_id: &Uuid) -> bool {
        let removed = self.peers.remove(client_id).is_some();
        if removed {
            log::debug!("Presence: {client_id} left");
            self.dirty = true;
        }
        removed
    }

    /// Forget every remote peer, used when the connection drops.
    pub fn clear_remote(&mut self) -> usize {
        let count = self.peers.len();
        if count > 0 {
            self.peers.clear();
            self.dirty = true;
        }
        count
    }

    /// Remove peers not refreshed within the stale timeout.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.config.stale_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
            log::debug!("Presence: evicted stale client {id}");
        }
        if !stale.is_empty() {
            self.dirty = true;
        }
        stale
    }

    /// Evict stale entries and rebuild the presence list.
    ///
    /// Returns the new list only when it differs from the previous one.
    pub fn recompute(&mut self, now: Instant) -> Option<Vec<PresenceEntry>> {
        self.evict_stale(now);
        if !self.dirty {
            return None;
        }
        self.dirty = false;

        let mut remote: Vec<&AwarenessState> = self.peers.values().map(|p| &p.state).collect();
        remote.sort_by(|a, b| {
            a.user
                .name
                .cmp(&b.user.name)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });

        let mut list = Vec::with_capacity(remote.len() + 1);
        list.push(PresenceEntry::from_state(&self.local));
        list.extend(remote.into_iter().map(PresenceEntry::from_state));

        if list == self.presence {
            return None;
        }
        self.presence = list.clone();
        Some(list)
    }

    /// Last computed presence list (local user first).
    pub fn presence(&self) -> &[PresenceEntry] {
        &self.presence
    }

    pub fn peer(&self, client_id: &Uuid) -> Option<&AwarenessState> {
        self.peers.get(client_id).map(|p| &p.state)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
