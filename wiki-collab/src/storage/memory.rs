//! In-process snapshot store.
//!
//! Used by tests and by hosts that persist elsewhere. Counts writes and can
//! be told to fail so error paths are easy to exercise.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{Snapshot, SnapshotContent, SnapshotMetadata, SnapshotStore, StoreError};

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, Snapshot>>,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a snapshot, as if written by an earlier session.
    pub async fn seed(&self, document_id: &str, content: SnapshotContent, metadata: SnapshotMetadata) {
        self.snapshots
            .write()
            .await
            .insert(document_id.to_string(), Snapshot { content, metadata });
    }

    pub async fn get(&self, document_id: &str) -> Option<Snapshot> {
        self.snapshots.read().await.get(document_id).cloned()
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Completed and failed write attempts.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Make every write take at least `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn read_snapshot(&self, document_id: &str) -> Result<Option<Snapshot>, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("reads disabled".into()));
        }
        Ok(self.snapshots.read().await.get(document_id).cloned())
    }

    async fn write_snapshot(
        &self,
        document_id: &str,
        content: &SnapshotContent,
        metadata: &SnapshotMetadata,
    ) -> Result<(), StoreError> {
        let delay = self.write_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }

        let mut snapshots = self.snapshots.write().await;
        let mut metadata = metadata.clone();
        if metadata.title.is_none() {
            metadata.title = snapshots
                .get(document_id)
                .and_then(|s| s.metadata.title.clone());
        }
        snapshots.insert(
            document_id.to_string(),
            Snapshot {
                content: content.clone(),
                metadata,
            },
        );
        Ok(())
    }
}
