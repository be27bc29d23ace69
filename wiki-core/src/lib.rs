//! # wiki-core: replicated rich-text document engine
//!
//! Owns the mergeable state of a single wiki page. Every local edit yields
//! a yrs v1 update that can be shipped to peers. Remote updates merge in
//! any order and may be applied more than once.
//!
//! ```text
//! local edit ──► ReplicatedDocument ──► update bytes ──► peers
//!                      ▲
//! peer update ─────────┘  apply_remote_update (fail closed)
//! ```

pub mod document;

pub use document::{Attributes, DocumentError, ReplicatedDocument, TextRun};

/// Re-exported so callers can hold state vectors without depending on yrs.
pub use yrs::StateVector;
