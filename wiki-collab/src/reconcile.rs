//! Keeps the durable snapshot in step with the live document.
//!
//! The replicated document is always the source of truth. This controller
//! only decides *when* to copy it out:
//!
//! ```text
//! edit/title ──► note_*_change()   deadline = now + debounce (trailing)
//! deadline   ──► fire_due()        spawned write, never cancelled
//! save/hide/close ──► flush()      awaited write, clears the deadline
//! connect #1 ──► bootstrap()       seed an empty document once
//! ```
//!
//! Writes reach the store in the order they were started: each spawned
//! write waits for the previous one, and `flush` waits for the last.
//! Writes that fail are reported and retried only by the next trigger.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use wiki_core::ReplicatedDocument;

use crate::storage::{SnapshotContent, SnapshotMetadata, SnapshotStore, StoreError};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Quiet period before a debounced write fires
    pub debounce: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

impl ReconcileConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
        }
    }
}

/// Result of the one-time snapshot import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Snapshot seeded the empty document; `update` should reach peers.
    Imported { update: Vec<u8> },
    /// Document already had content; snapshot left untouched.
    SkippedNonEmpty,
    /// Nothing usable stored.
    NoSnapshot,
    /// Bootstrap already ran in this session.
    AlreadyDone,
}

/// What triggered a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Debounce,
    /// Save shortcut
    Explicit,
    /// Window lost visibility
    Hidden,
    /// Session teardown
    Closing,
}

/// Completion report for a write.
#[derive(Debug, Clone)]
pub struct PersistOutcome {
    pub reason: FlushReason,
    pub character_count: u32,
    pub result: Result<(), StoreError>,
}

pub struct Reconciler {
    document_id: String,
    store: Arc<dyn SnapshotStore>,
    config: ReconcileConfig,
    bootstrapped: bool,
    title: Option<String>,
    deadline: Option<Instant>,
    in_flight: Arc<AtomicUsize>,
    last_write: Option<JoinHandle<()>>,
    outcome_tx: mpsc::UnboundedSender<PersistOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<PersistOutcome>,
}

impl Reconciler {
    pub fn new(document_id: impl Into<String>, store: Arc<dyn SnapshotStore>, config: ReconcileConfig) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            document_id: document_id.into(),
            store,
            config,
            bootstrapped: false,
            title: None,
            deadline: None,
            in_flight: Arc::new(AtomicUsize::new(0)),
            last_write: None,
            outcome_tx,
            outcome_rx,
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Current title, either set locally or adopted from the snapshot.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Pending debounce deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Spawned writes not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Seed `doc` from the stored snapshot, at most once per session.
    ///
    /// A read failure leaves the bootstrap pending so the next connection
    /// tries again.
    pub async fn bootstrap(&mut self, doc: &mut ReplicatedDocument) -> Result<BootstrapOutcome, StoreError> {
        if self.bootstrapped {
            return Ok(BootstrapOutcome::AlreadyDone);
        }
        if !doc.is_empty() {
            self.bootstrapped = true;
            log::info!("Bootstrap of {}: document already has content", self.document_id);
            return Ok(BootstrapOutcome::SkippedNonEmpty);
        }

        let snapshot = self.store.read_snapshot(&self.document_id).await?;
        self.bootstrapped = true;

        let Some(snapshot) = snapshot else {
            log::info!("Bootstrap of {}: no snapshot stored", self.document_id);
            return Ok(BootstrapOutcome::NoSnapshot);
        };

        if self.title.is_none() {
            self.title = snapshot.metadata.title.clone();
        }

        match doc.seed_from_snapshot(&snapshot.content.body, snapshot.content.state()) {
            Ok(Some(update)) => {
                log::info!(
                    "Bootstrap of {}: imported snapshot ({} chars)",
                    self.document_id,
                    doc.character_count()
                );
                Ok(BootstrapOutcome::Imported { update })
            }
            Ok(None) if doc.is_empty() => Ok(BootstrapOutcome::NoSnapshot),
            Ok(None) => Ok(BootstrapOutcome::SkippedNonEmpty),
            Err(e) => {
                log::warn!("Bootstrap of {}: snapshot rejected: {e}", self.document_id);
                Ok(BootstrapOutcome::NoSnapshot)
            }
        }
    }

    pub fn note_content_change(&mut self, now: Instant) {
        self.deadline = Some(now + self.config.debounce);
    }

    pub fn note_title_change(&mut self, title: impl Into<String>, now: Instant) {
        self.title = Some(title.into());
        self.deadline = Some(now + self.config.debounce);
    }

    /// Spawn the debounced write if its deadline has passed.
    pub fn fire_due(&mut self, doc: &ReplicatedDocument, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                self.spawn_write(doc, FlushReason::Debounce);
                true
            }
            _ => false,
        }
    }

    /// Write immediately, bypassing the debounce.
    ///
    /// An empty document that never bootstrapped is not written, so a session
    /// that never reached the relay cannot blank out the stored snapshot.
    pub async fn flush(&mut self, doc: &ReplicatedDocument, reason: FlushReason) -> Result<(), StoreError> {
        self.deadline = None;
        if !self.bootstrapped && doc.is_empty() {
            log::debug!("Skipping {reason:?} flush of {}: nothing loaded", self.document_id);
            return Ok(());
        }
        if let Some(previous) = self.last_write.take() {
            let _ = previous.await;
        }
        let (content, metadata) = self.capture(doc);
        let result = self
            .store
            .write_snapshot(&self.document_id, &content, &metadata)
            .await;
        log_outcome(&self.document_id, reason, &result);
        result
    }

    /// Next completed debounced write.
    pub async fn next_outcome(&mut self) -> Option<PersistOutcome> {
        self.outcome_rx.recv().await
    }

    fn capture(&self, doc: &ReplicatedDocument) -> (SnapshotContent, SnapshotMetadata) {
        let content = SnapshotContent {
            body: doc.content(),
            state: doc.encode_state(),
        };
        let metadata = SnapshotMetadata::now(self.title.clone(), doc.character_count() as u32);
        (content, metadata)
    }

    fn spawn_write(&mut self, doc: &ReplicatedDocument, reason: FlushReason) {
        let (content, metadata) = self.capture(doc);
        let store = Arc::clone(&self.store);
        let document_id = self.document_id.clone();
        let tx = self.outcome_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let previous = self.last_write.take();

        in_flight.fetch_add(1, Ordering::AcqRel);
        self.last_write = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = store.write_snapshot(&document_id, &content, &metadata).await;
            in_flight.fetch_sub(1, Ordering::AcqRel);
            log_outcome(&document_id, reason, &result);
            let _ = tx.send(PersistOutcome {
                reason,
                character_count: metadata.character_count,
                result,
            });
        }));
    }
}

fn log_outcome(document_id: &str, reason: FlushReason, result: &Result<(), StoreError>) {
    match result {
        Ok(()) => log::debug!("Persisted {document_id} ({reason:?})"),
        Err(e) => log::warn!("Persisting {document_id} failed ({reason:?}): {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySnapshotStore;

    fn setup() -> (Arc<MemorySnapshotStore>, Reconciler) {
        let store = Arc::new(MemorySnapshotStore::new());
        let rec = Reconciler::new("doc", store.clone(), ReconcileConfig::default());
        (store, rec)
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_edits() {
        let (store, mut rec) = setup();
        let mut doc = ReplicatedDocument::new("doc");
        let start = Instant::now();

        for (i, ch) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let now = start + Duration::from_millis(100 * i as u64);
            doc.push(ch);
            rec.note_content_change(now);
            assert!(!rec.fire_due(&doc, now));
        }

        // 400ms after the last edit: still quiet period.
        assert!(!rec.fire_due(&doc, start + Duration::from_millis(800)));
        assert!(rec.fire_due(&doc, start + Duration::from_millis(900)));
        assert!(rec.deadline().is_none());

        let outcome = rec.next_outcome().await.unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.reason, FlushReason::Debounce);
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.get("doc").await.unwrap().content.body, "abcde");
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_write_not_cancelled() {
        let (store, mut rec) = setup();
        store.set_write_delay(Duration::from_millis(200));
        let mut doc = ReplicatedDocument::new("doc");
        let now = Instant::now();

        doc.push("first");
        rec.note_content_change(now);
        assert!(rec.fire_due(&doc, now + Duration::from_millis(500)));
        tokio::task::yield_now().await;
        assert_eq!(rec.in_flight(), 1);
        tokio::time::advance(Duration::from_millis(100)).await;

        doc.push(" second");
        rec.note_content_change(now + Duration::from_millis(510));
        assert!(rec.fire_due(&doc, now + Duration::from_millis(1010)));

        assert!(rec.next_outcome().await.unwrap().result.is_ok());
        assert!(rec.next_outcome().await.unwrap().result.is_ok());
        assert_eq!(store.write_count(), 2);
        assert_eq!(rec.in_flight(), 0);
        assert_eq!(store.get("doc").await.unwrap().content.body, "first second");
    }

    #[tokio::test]
    async fn test_flush_clears_deadline_and_writes_title() {
        let (store, mut rec) = setup();
        let mut doc = ReplicatedDocument::new("doc");
        doc.push("body");
        rec.note_title_change("My page", Instant::now());
        assert!(rec.deadline().is_some());

        rec.flush(&doc, FlushReason::Explicit).await.unwrap();
        assert!(rec.deadline().is_none());

        let snap = store.get("doc").await.unwrap();
        assert_eq!(snap.metadata.title.as_deref(), Some("My page"));
        assert_eq!(snap.metadata.character_count, 4);
        assert!(!snap.content.state.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_flush_lands_after_slow_debounced_write() {
        let (store, mut rec) = setup();
        store.set_write_delay(Duration::from_millis(500));
        let mut doc = ReplicatedDocument::new("doc");
        let now = Instant::now();

        doc.push("v1");
        rec.note_content_change(now);
        assert!(rec.fire_due(&doc, now + Duration::from_millis(500)));
        tokio::task::yield_now().await;
        assert_eq!(rec.in_flight(), 1);

        doc.push(" v2");
        rec.flush(&doc, FlushReason::Closing).await.unwrap();

        assert_eq!(rec.in_flight(), 0);
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.get("doc").await.unwrap().content.body, "v1 v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_writes_land_in_order() {
        let (store, mut rec) = setup();
        store.set_write_delay(Duration::from_millis(300));
        let mut doc = ReplicatedDocument::new("doc");
        let now = Instant::now();

        doc.push("one");
        rec.note_content_change(now);
        assert!(rec.fire_due(&doc, now + Duration::from_millis(500)));
        tokio::task::yield_now().await;

        // Faster store for the second write; it must still land last.
        store.set_write_delay(Duration::ZERO);
        doc.push(" two");
        rec.note_content_change(now + Duration::from_millis(500));
        assert!(rec.fire_due(&doc, now + Duration::from_millis(1000)));

        assert!(rec.next_outcome().await.unwrap().result.is_ok());
        assert!(rec.next_outcome().await.unwrap().result.is_ok());
        assert_eq!(store.get("doc").await.unwrap().content.body, "one two");
    }

    #[tokio::test]
    async fn test_flush_failure_leaves_document_intact() {
        let (store, mut rec) = setup();
        store.set_fail_writes(true);
        let mut doc = ReplicatedDocument::new("doc");
        doc.push("keep me");

        assert!(rec.flush(&doc, FlushReason::Hidden).await.is_err());
        assert_eq!(doc.content(), "keep me");
    }

    #[tokio::test]
    async fn test_flush_of_unloaded_empty_document_keeps_snapshot() {
        let (store, mut rec) = setup();
        store
            .seed(
                "doc",
                SnapshotContent {
                    body: "stored".into(),
                    state: Vec::new(),
                },
                SnapshotMetadata::now(None, 6),
            )
            .await;
        let doc = ReplicatedDocument::new("doc");

        rec.flush(&doc, FlushReason::Closing).await.unwrap();
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.get("doc").await.unwrap().content.body, "stored");
    }

    #[tokio::test]
    async fn test_bootstrap_imports_once() {
        let (store, mut rec) = setup();
        let mut source = ReplicatedDocument::new("doc");
        source.push("from snapshot");
        store
            .seed(
                "doc",
                SnapshotContent {
                    body: source.content(),
                    state: source.encode_state(),
                },
                SnapshotMetadata::now(Some("Stored title".into()), 13),
            )
            .await;

        let mut doc = ReplicatedDocument::new("doc");
        let first = rec.bootstrap(&mut doc).await.unwrap();
        assert!(matches!(first, BootstrapOutcome::Imported { .. }));
        assert_eq!(doc.content(), "from snapshot");
        assert_eq!(rec.title(), Some("Stored title"));

        assert_eq!(rec.bootstrap(&mut doc).await.unwrap(), BootstrapOutcome::AlreadyDone);
        assert_eq!(doc.content(), "from snapshot");
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_skips_non_empty() {
        let (store, mut rec) = setup();
        store
            .seed(
                "doc",
                SnapshotContent {
                    body: "stale".into(),
                    state: Vec::new(),
                },
                SnapshotMetadata::default(),
            )
            .await;

        let mut doc = ReplicatedDocument::new("doc");
        doc.push("local");
        assert_eq!(rec.bootstrap(&mut doc).await.unwrap(), BootstrapOutcome::SkippedNonEmpty);
        assert_eq!(doc.content(), "local");
        assert_eq!(store.read_count(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_no_snapshot() {
        let (_store, mut rec) = setup();
        let mut doc = ReplicatedDocument::new("doc");
        assert_eq!(rec.bootstrap(&mut doc).await.unwrap(), BootstrapOutcome::NoSnapshot);
        assert!(rec.is_bootstrapped());
    }

    #[tokio::test]
    async fn test_bootstrap_read_failure_stays_pending() {
        let (store, mut rec) = setup();
        store.set_fail_reads(true);
        let mut doc = ReplicatedDocument::new("doc");

        assert!(rec.bootstrap(&mut doc).await.is_err());
        assert!(!rec.is_bootstrapped());

        store.set_fail_reads(false);
        assert_eq!(rec.bootstrap(&mut doc).await.unwrap(), BootstrapOutcome::NoSnapshot);
    }
}
