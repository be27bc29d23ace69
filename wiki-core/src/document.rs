//! Mergeable rich-text state for one open page.
//!
//! A [`ReplicatedDocument`] wraps a yrs `Doc` holding a single root text
//! (`content`). Formatting lives as attributes on text runs, so bold, links,
//! headings etc. merge with the same guarantees as the characters themselves.
//!
//! Offsets are UTF-16 code units, matching browser peers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use yrs::types::text::{Diff, YChange};
use yrs::types::Attrs;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef, Transact,
    Update,
};

/// Name of the root text shared with every peer.
const CONTENT_ROOT: &str = "content";

/// Formatting attributes attached to a run of text (`bold -> "true"`, `link -> url`).
pub type Attributes = BTreeMap<String, String>;

/// A maximal run of text sharing the same formatting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRun {
    pub text: String,
    pub attributes: Attributes,
}

/// Errors raised by the document engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// Update bytes could not be decoded; nothing was applied.
    MalformedUpdate(String),
    /// State vector bytes could not be decoded.
    MalformedStateVector(String),
    /// yrs refused to integrate a decoded update.
    Apply(String),
    /// Edit addressed a position past the end of the text.
    OutOfBounds { index: u32, len: u32 },
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedUpdate(e) => write!(f, "Malformed update: {e}"),
            Self::MalformedStateVector(e) => write!(f, "Malformed state vector: {e}"),
            Self::Apply(e) => write!(f, "Failed to apply update: {e}"),
            Self::OutOfBounds { index, len } => {
                write!(f, "Position {index} is out of bounds for text of length {len}")
            }
        }
    }
}

impl std::error::Error for DocumentError {}

/// The replicated document owned by exactly one editing session.
pub struct ReplicatedDocument {
    document_id: String,
    doc: Doc,
    content: TextRef,
}

impl ReplicatedDocument {
    /// Allocate empty mergeable state for `document_id`.
    pub fn new(document_id: impl Into<String>) -> Self {
        let options = Options {
            offset_kind: OffsetKind::Utf16,
            ..Options::default()
        };
        let doc = Doc::with_options(options);
        let content = doc.get_or_insert_text(CONTENT_ROOT);
        let document_id = document_id.into();
        log::debug!("Created replicated document {document_id}");

        Self {
            document_id,
            doc,
            content,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Insert plain text at `index`, returning the update to broadcast.
    pub fn insert(&mut self, index: u32, text: &str) -> Result<Vec<u8>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        let len = self.content.len(&txn);
        if index > len {
            return Err(DocumentError::OutOfBounds { index, len });
        }
        self.content.insert(&mut txn, index, text);
        Ok(txn.encode_update_v1())
    }

    /// Insert text carrying formatting attributes.
    pub fn insert_formatted(
        &mut self,
        index: u32,
        text: &str,
        attributes: &Attributes,
    ) -> Result<Vec<u8>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        let len = self.content.len(&txn);
        if index > len {
            return Err(DocumentError::OutOfBounds { index, len });
        }
        self.content
            .insert_with_attributes(&mut txn, index, text, to_attrs(attributes));
        Ok(txn.encode_update_v1())
    }

    /// Append text at the end.
    pub fn push(&mut self, text: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.content.push(&mut txn, text);
        txn.encode_update_v1()
    }

    /// Apply formatting to `len` units starting at `index`.
    ///
    /// An attribute with an empty value removes that attribute.
    pub fn format(
        &mut self,
        index: u32,
        len: u32,
        attributes: &Attributes,
    ) -> Result<Vec<u8>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        let total = self.content.len(&txn);
        if index.saturating_add(len) > total {
            return Err(DocumentError::OutOfBounds {
                index: index.saturating_add(len),
                len: total,
            });
        }
        self.content.format(&mut txn, index, len, to_attrs(attributes));
        Ok(txn.encode_update_v1())
    }

    /// Remove `len` units starting at `index`.
    pub fn remove(&mut self, index: u32, len: u32) -> Result<Vec<u8>, DocumentError> {
        let mut txn = self.doc.transact_mut();
        let total = self.content.len(&txn);
        if index.saturating_add(len) > total {
            return Err(DocumentError::OutOfBounds {
                index: index.saturating_add(len),
                len: total,
            });
        }
        self.content.remove_range(&mut txn, index, len);
        Ok(txn.encode_update_v1())
    }

    /// Replace the whole text in a single transaction.
    pub fn replace_all(&mut self, text: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let len = self.content.len(&txn);
        if len > 0 {
            self.content.remove_range(&mut txn, 0, len);
        }
        self.content.insert(&mut txn, 0, text);
        txn.encode_update_v1()
    }

    // ─── Inspection ───────────────────────────────────────────────────

    /// Plain text content, formatting stripped.
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Length in UTF-16 code units.
    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.content.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of user-perceived characters (Unicode scalar values).
    pub fn character_count(&self) -> usize {
        self.content().chars().count()
    }

    /// Formatted runs in document order.
    pub fn runs(&self) -> Vec<TextRun> {
        let txn = self.doc.transact();
        let diff: Vec<Diff<YChange>> = self.content.diff(&txn, YChange::identity);
        diff.into_iter()
            .map(|d| TextRun {
                text: d.insert.to_string(&txn),
                attributes: d
                    .attributes
                    .map(|attrs| {
                        attrs
                            .iter()
                            .map(|(k, v)| (k.to_string(), any_to_string(v)))
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Summary of operations seen per client.
    pub fn state_vector(&self) -> StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }

    pub fn encoded_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Full state as a single update (what a brand-new peer would need).
    pub fn encode_state(&self) -> Vec<u8> {
        self.compute_local_update_from(&StateVector::default())
    }

    // ─── Replication ──────────────────────────────────────────────────

    /// Merge an update received from a peer.
    ///
    /// The bytes are fully decoded before a transaction is opened, so corrupt
    /// input never reaches the document. Already-known operations are skipped.
    ///
    /// Returns `true` when the merge inserted or deleted anything. A pure
    /// deletion leaves the state vector alone, so the transaction's delete
    /// set is checked as well.
    pub fn apply_remote_update(&mut self, bytes: &[u8]) -> Result<bool, DocumentError> {
        let update = Update::decode_v1(bytes)
            .map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        let before = txn.state_vector();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))?;
        Ok(txn.state_vector() != before || !txn.delete_set().is_empty())
    }

    /// Minimal diff bringing a peer at `since_vector` up to our state.
    pub fn compute_local_update(&self, since_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(since_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        Ok(self.compute_local_update_from(&sv))
    }

    pub fn compute_local_update_from(&self, since: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_diff_v1(since)
    }

    /// Seed an empty document from a persisted snapshot.
    ///
    /// Returns `Ok(None)` without touching anything when the document already
    /// has content or the snapshot has nothing to offer. Otherwise returns the
    /// update to broadcast. CRDT `state` is preferred over `body`; the body is
    /// only inserted when the state is missing or unusable.
    pub fn seed_from_snapshot(
        &mut self,
        body: &str,
        state: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, DocumentError> {
        if !self.is_empty() {
            return Ok(None);
        }

        if let Some(state) = state.filter(|s| !s.is_empty()) {
            match self.apply_remote_update(state) {
                Ok(_) if !self.is_empty() => return Ok(Some(state.to_vec())),
                Ok(_) => {}
                Err(e) => {
                    log::warn!(
                        "Snapshot state for {} unusable, falling back to body: {e}",
                        self.document_id
                    );
                }
            }
        }

        if body.is_empty() {
            return Ok(None);
        }
        self.insert(0, body).map(Some)
    }

    /// Release the document. Consumes the handle.
    pub fn destroy(self) {
        log::debug!("Destroyed replicated document {}", self.document_id);
    }
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("document_id", &self.document_id)
            .field("len", &self.len())
            .finish()
    }
}

fn to_attrs(attributes: &Attributes) -> Attrs {
    attributes
        .iter()
        .map(|(k, v)| {
            let value = if v.is_empty() {
                Any::Null
            } else {
                Any::String(Arc::from(v.as_str()))
            };
            (Arc::<str>::from(k.as_str()), value)
        })
        .collect()
}

fn any_to_string(value: &Any) -> String {
    match value {
        Any::String(s) => s.to_string(),
        other => other.to_string(),
    }
}
