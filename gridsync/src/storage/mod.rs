//! Durable persistence behind the document store.
//!
//! The sync engine only depends on the [`Persistence`] trait — the
//! canonical relational storage of table data lives elsewhere and is
//! out of scope here. [`rocks::PersistedStore`] is the backend used by
//! the server when a storage path is configured: LZ4-compressed
//! snapshots and op-log entries in RocksDB column families.

pub mod rocks;

pub use rocks::{DocumentMetadata, PersistedStore, StorageConfig};

use crate::edit::CommittedOp;
use crate::value::{Collection, DocData};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StorageError {
    DatabaseError(String),
    NotFound(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StorageError::NotFound(key) => write!(f, "Document not found: {key}"),
            StorageError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StorageError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StorageError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::DatabaseError(e.to_string())
    }
}

/// The seam between the sync engine and durable storage.
pub trait Persistence: Send + Sync {
    /// Load the latest persisted snapshot and version of a document.
    fn load_document(
        &self,
        collection: &Collection,
        doc_id: &str,
    ) -> Result<Option<(DocData, u64)>, StorageError>;

    /// Persist an accepted operation together with the snapshot it
    /// produced, atomically.
    fn persist_operation(
        &self,
        committed: &CommittedOp,
        data: &DocData,
    ) -> Result<(), StorageError>;

    /// Load committed operations after `since_version`, in version
    /// order. The durable op-log reaches further back than the
    /// in-memory one, which restarts empty and is trimmed over time.
    fn load_ops_since(
        &self,
        collection: &Collection,
        doc_id: &str,
        since_version: u64,
    ) -> Result<Vec<CommittedOp>, StorageError>;

    /// Drop op-log entries at or below `up_to_version`; the persisted
    /// snapshot already covers them. Returns the number removed.
    fn compact_ops(
        &self,
        collection: &Collection,
        doc_id: &str,
        up_to_version: u64,
    ) -> Result<u64, StorageError>;

    /// Enumerate every persisted document, for startup recovery.
    fn list_documents(&self) -> Result<Vec<(Collection, String)>, StorageError>;
}
