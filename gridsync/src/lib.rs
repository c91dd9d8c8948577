//! # gridsync — Real-time sync engine for collaborative tables
//!
//! Multi-client synchronization over versioned table documents:
//! operational transform for conflict resolution, live queries with
//! incremental result-set maintenance, and scope-based access
//! mediation for shared (read-only, field-filtered) connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │  SyncServer  │
//! │ (per user)  │    Binary frames    │  (authority) │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                      ┌─────────────────────┼──────────────────┐
//!                      ▼                     ▼                  ▼
//!              ┌───────────────┐    ┌────────────────┐  ┌──────────────┐
//!              │ AccessMediator│    │ DocumentStore  │  │ Subscription │
//!              │ (scope filter)│    │ (version + OT) │  │    Index     │
//!              └───────────────┘    └───────┬────────┘  └──────────────┘
//!                                           │
//!                                    ┌──────┴───────┐
//!                                    │   RocksDB    │
//!                                    │ (snapshots + │
//!                                    │   op log)    │
//!                                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`value`] — Cell values, document data, collection naming
//! - [`edit`] — The closed edit set and operation types
//! - [`transform`] — Operational transform over concurrent edits
//! - [`store`] — Versioned documents with per-document serialization
//! - [`query`] — Live query predicates and the subscription index
//! - [`mediator`] — Share-scope authorization and outbound filtering
//! - [`session`] — Per-connection sessions and the session registry
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`storage`] — RocksDB persistence behind the store

pub mod value;
pub mod edit;
pub mod transform;
pub mod protocol;
pub mod query;
pub mod mediator;
pub mod store;
pub mod session;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use value::{CellValue, Collection, CollectionKind, DocData};
pub use edit::{apply_edit, ApplyError, CommittedOp, Edit, Operation};
pub use transform::{transform_edit, transform_operation, TransformError};
pub use protocol::{
    ClientFrame, DocSnapshot, ErrorCode, ProtocolError, ServerFrame, SHARE_TOKEN_PARAM,
};
pub use query::{DocChange, Predicate, QueryEvent, SubscriptionIndex};
pub use mediator::{
    AccessMediator, Scope, ShareScope, ShareTokenResolver, StaticShareResolver,
};
pub use store::{AppendOutcome, DocumentStore, StoreError};
pub use session::{Session, SessionRegistry};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use storage::{
    DocumentMetadata, Persistence, PersistedStore, StorageConfig, StorageError,
};
