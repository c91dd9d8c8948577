//! RocksDB-backed persistence for documents and their op-logs.
//!
//! Column families:
//! - `documents` — latest snapshot per document (LZ4 compressed)
//! - `oplog`     — committed operations (LZ4 compressed, keyed by
//!                 document key + version)
//! - `metadata`  — per-document bookkeeping (bincode)
//!
//! Keys render the document address as `"<collection>/<doc_id>"`; op-log
//! keys append a NUL separator and the big-endian version so a prefix
//! scan walks one document's operations in version order.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{Persistence, StorageError};
use crate::edit::CommittedOp;
use crate::value::{Collection, DocData};

const CF_DOCUMENTS: &str = "documents";
const CF_OPLOG: &str = "oplog";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPLOG, CF_METADATA];

/// Separator between the document key and the op-log version suffix.
/// Collection names and document ids never contain NUL.
const OPLOG_SEP: u8 = 0;

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gridsync_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Config for testing (small caches, temp directory).
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

/// Per-document bookkeeping stored alongside snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub collection: String,
    pub doc_id: String,
    /// Version of the persisted snapshot.
    pub version: u64,
    /// Op-log entries currently stored.
    pub op_count: u64,
    /// Uncompressed snapshot size in bytes.
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes.
    pub compressed_size: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(collection: &Collection, doc_id: &str) -> Self {
        let now = unix_now();
        Self {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            version: 0,
            op_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Snapshot payload persisted in the `documents` column family.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedDoc {
    version: u64,
    data: DocData,
}

/// RocksDB-backed document persistence.
pub struct PersistedStore {
    /// Single-threaded mode — concurrency comes from the callers.
    db: DBWithThreadMode<SingleThreaded>,
    config: StorageConfig,
}

impl PersistedStore {
    /// Open the store at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StorageConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // LZ4 — fast decompression on the hot read path.
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Persist the latest snapshot of a document (LZ4 compressed).
    pub fn save_document(
        &self,
        collection: &Collection,
        doc_id: &str,
        data: &DocData,
        version: u64,
    ) -> Result<DocumentMetadata, StorageError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = encode_doc(data, version)?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let key = doc_key(collection, doc_id);
        let mut meta = self
            .load_metadata(collection, doc_id)
            .unwrap_or_else(|_| DocumentMetadata::new(collection, doc_id));
        meta.version = version;
        meta.snapshot_size = encoded.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_docs, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load the latest persisted snapshot of a document.
    pub fn load_snapshot(
        &self,
        collection: &Collection,
        doc_id: &str,
    ) -> Result<(DocData, u64), StorageError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let key = doc_key(collection, doc_id);

        match self.db.get_cf(&cf, &key)? {
            Some(compressed) => {
                let encoded = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StorageError::CompressionError(e.to_string()))?;
                decode_doc(&encoded)
            }
            None => Err(StorageError::NotFound(format!("{collection}/{doc_id}"))),
        }
    }

    /// Check if a document exists.
    pub fn document_exists(
        &self,
        collection: &Collection,
        doc_id: &str,
    ) -> Result<bool, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, doc_key(collection, doc_id))?.is_some())
    }

    // ─── Op-log ───────────────────────────────────────────────────────

    /// Persist one committed operation (LZ4-compressed bincode).
    pub fn store_op(&self, committed: &CommittedOp) -> Result<(), StorageError> {
        let cf_ops = self.cf(CF_OPLOG)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let collection = &committed.op.collection;
        let doc_id = &committed.op.doc_id;

        let encoded = bincode::serde::encode_to_vec(committed, bincode::config::standard())
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self
            .load_metadata(collection, doc_id)
            .unwrap_or_else(|_| DocumentMetadata::new(collection, doc_id));
        meta.op_count += 1;
        meta.updated_at = unix_now();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, oplog_key(collection, doc_id, committed.version), &compressed);
        batch.put_cf(&cf_meta, doc_key(collection, doc_id), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(())
    }

    /// Load committed operations after `since_version`, in order.
    pub fn load_ops_since(
        &self,
        collection: &Collection,
        doc_id: &str,
        since_version: u64,
    ) -> Result<Vec<CommittedOp>, StorageError> {
        let cf = self.cf(CF_OPLOG)?;
        let prefix = oplog_prefix(collection, doc_id);
        let start_key = oplog_key(collection, doc_id, since_version + 1);

        let mut ops = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let encoded = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StorageError::CompressionError(e.to_string()))?;
            let (committed, _) =
                bincode::serde::decode_from_slice(&encoded, bincode::config::standard())
                    .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
            ops.push(committed);
        }
        Ok(ops)
    }

    /// Delete op-log entries already covered by the persisted snapshot.
    pub fn compact_ops(
        &self,
        collection: &Collection,
        doc_id: &str,
        up_to_version: u64,
    ) -> Result<u64, StorageError> {
        let cf = self.cf(CF_OPLOG)?;
        let prefix = oplog_prefix(collection, doc_id);
        let start_key = oplog_key(collection, doc_id, 0);
        let end_key = oplog_key(collection, doc_id, up_to_version + 1);

        let mut count = 0u64;
        let mut batch = WriteBatch::default();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) || key.as_ref() >= end_key.as_slice() {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch)?;
            if let Ok(mut meta) = self.load_metadata(collection, doc_id) {
                meta.op_count = meta.op_count.saturating_sub(count);
                let cf_meta = self.cf(CF_METADATA)?;
                self.db.put_cf(&cf_meta, doc_key(collection, doc_id), meta.encode()?)?;
            }
        }
        Ok(count)
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    /// Load document bookkeeping.
    pub fn load_metadata(
        &self,
        collection: &Collection,
        doc_id: &str,
    ) -> Result<DocumentMetadata, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_key(collection, doc_id))? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StorageError::NotFound(format!("{collection}/{doc_id}"))),
        }
    }

    /// Enumerate every persisted document.
    pub fn list_all(&self) -> Result<Vec<(Collection, String)>, StorageError> {
        let cf = self.cf(CF_METADATA)?;
        let mut docs = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            let key_str = std::str::from_utf8(&key)
                .map_err(|_| StorageError::DeserializationError("Invalid key encoding".into()))?;
            if let Some((collection_str, doc_id)) = key_str.split_once('/') {
                if let Some(collection) = Collection::parse(collection_str) {
                    docs.push((collection, doc_id.to_string()));
                }
            }
        }
        Ok(docs)
    }

    /// Delete a document, its op-log, and its metadata.
    pub fn delete_document(
        &self,
        collection: &Collection,
        doc_id: &str,
    ) -> Result<(), StorageError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_ops = self.cf(CF_OPLOG)?;

        let key = doc_key(collection, doc_id);
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, &key);
        batch.delete_cf(&cf_meta, &key);

        let prefix = oplog_prefix(collection, doc_id);
        let iter = self.db.iterator_cf(
            &cf_ops,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (op_key, _) = item.map_err(|e| StorageError::DatabaseError(e.to_string()))?;
            if !op_key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_ops, &op_key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Flush buffered writes to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(|e| StorageError::DatabaseError(e.to_string()))
    }

    /// The database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl Persistence for PersistedStore {
    fn load_document(
        &self,
        collection: &Collection,
        doc_id: &str,
    ) -> Result<Option<(DocData, u64)>, StorageError> {
        match self.load_snapshot(collection, doc_id) {
            Ok(loaded) => Ok(Some(loaded)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn persist_operation(
        &self,
        committed: &CommittedOp,
        data: &DocData,
    ) -> Result<(), StorageError> {
        self.store_op(committed)?;
        self.save_document(
            &committed.op.collection,
            &committed.op.doc_id,
            data,
            committed.version,
        )?;
        Ok(())
    }

    fn load_ops_since(
        &self,
        collection: &Collection,
        doc_id: &str,
        since_version: u64,
    ) -> Result<Vec<CommittedOp>, StorageError> {
        PersistedStore::load_ops_since(self, collection, doc_id, since_version)
    }

    fn compact_ops(
        &self,
        collection: &Collection,
        doc_id: &str,
        up_to_version: u64,
    ) -> Result<u64, StorageError> {
        PersistedStore::compact_ops(self, collection, doc_id, up_to_version)
    }

    fn list_documents(&self) -> Result<Vec<(Collection, String)>, StorageError> {
        self.list_all()
    }
}

fn encode_doc(data: &DocData, version: u64) -> Result<Vec<u8>, StorageError> {
    bincode::serde::encode_to_vec(
        PersistedDoc { version, data: data.clone() },
        bincode::config::standard(),
    )
    .map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_doc(bytes: &[u8]) -> Result<(DocData, u64), StorageError> {
    let (doc, _): (PersistedDoc, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::DeserializationError(e.to_string()))?;
    Ok((doc.data, doc.version))
}

/// `"<collection>/<doc_id>"` — the document address as a storage key.
fn doc_key(collection: &Collection, doc_id: &str) -> Vec<u8> {
    format!("{collection}/{doc_id}").into_bytes()
}

/// Document key + NUL + version (8 bytes big-endian).
fn oplog_key(collection: &Collection, doc_id: &str, version: u64) -> Vec<u8> {
    let mut key = oplog_prefix(collection, doc_id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn oplog_prefix(collection: &Collection, doc_id: &str) -> Vec<u8> {
    let mut key = doc_key(collection, doc_id);
    key.push(OPLOG_SEP);
    key
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
