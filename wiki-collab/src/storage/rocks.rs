//! RocksDB-backed snapshot store.
//!
//! Column families:
//! - `documents`: bincode `SnapshotContent` (body + yrs state), LZ4 compressed
//! - `metadata`: bincode `SnapshotMetadata` (title, character count, updated-at)
//!
//! Both are written in one atomic batch per snapshot, keyed by document id.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Snapshot, SnapshotContent, SnapshotMetadata, SnapshotStore, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every snapshot write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("wiki_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Durable snapshot store shared by every session in the process.
///
/// Cloning is cheap and shares the open database. The async
/// [`SnapshotStore`] methods run on tokio's blocking pool; the synchronous
/// methods block the caller.
#[derive(Clone)]
pub struct RocksSnapshotStore {
    db: Arc<DBWithThreadMode<SingleThreaded>>,
    config: Arc<StoreConfig>,
}

impl RocksSnapshotStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Bodies are already LZ4 compressed by us.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Store body, state and metadata atomically.
    pub fn save_snapshot(
        &self,
        document_id: &str,
        content: &SnapshotContent,
        metadata: &SnapshotMetadata,
    ) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(&encode(content)?);

        let mut metadata = metadata.clone();
        if metadata.title.is_none() {
            metadata.title = self.load_metadata(document_id)?.and_then(|m| m.title);
        }

        let key = document_id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, key, &compressed);
        batch.put_cf(&cf_meta, key, encode(&metadata)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Stored snapshot for {document_id} ({} bytes compressed)",
            compressed.len()
        );
        Ok(())
    }

    pub fn load_snapshot(&self, document_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let Some(compressed) = self.db.get_cf(&cf, document_id.as_bytes())? else {
            return Ok(None);
        };

        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let content: SnapshotContent = decode(&raw)?;
        let metadata = self.load_metadata(document_id)?.unwrap_or_default();

        Ok(Some(Snapshot { content, metadata }))
    }

    pub fn load_metadata(&self, document_id: &str) -> Result<Option<SnapshotMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Ids of every stored document.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            match String::from_utf8(key.to_vec()) {
                Ok(id) => ids.push(id),
                Err(_) => log::warn!("Skipping non-UTF-8 document key"),
            }
        }
        Ok(ids)
    }

    pub fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        if self.db.get_cf(&cf_meta, document_id.as_bytes())?.is_none() {
            return Err(StoreError::NotFound(document_id.to_string()));
        }

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, document_id.as_bytes());
        batch.delete_cf(&cf_meta, document_id.as_bytes());
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        log::info!("Deleted snapshot for {document_id}");
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl SnapshotStore for RocksSnapshotStore {
    async fn read_snapshot(&self, document_id: &str) -> Result<Option<Snapshot>, StoreError> {
        let store = self.clone();
        let document_id = document_id.to_string();
        tokio::task::spawn_blocking(move || store.load_snapshot(&document_id))
            .await
            .map_err(|e| StoreError::Unavailable(format!("Read task failed: {e}")))?
    }

    async fn write_snapshot(
        &self,
        document_id: &str,
        content: &SnapshotContent,
        metadata: &SnapshotMetadata,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let document_id = document_id.to_string();
        let content = content.clone();
        let metadata = metadata.clone();
        tokio::task::spawn_blocking(move || store.save_snapshot(&document_id, &content, &metadata))
            .await
            .map_err(|e| StoreError::Unavailable(format!("Write task failed: {e}")))?
    }
}
