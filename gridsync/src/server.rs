//! WebSocket sync server: op submission, conflict resolution, fan-out.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Session (scope) ── AccessMediator
//! Client B ──┘         │                  │
//!                      ▼                  ▼
//!               SubscriptionIndex ── DocumentStore ── RocksDB
//!                      │                  │              │
//!                      │                  │              ├── Snapshots (LZ4)
//!                      │                  │              └── Op log (LZ4)
//!                      ▼                  ▼
//!            QueryEvents per session   CommittedOp
//!                      │
//!           ┌──────────┼───────────┐
//!           ▼          ▼           ▼
//!        Client A   Client B    Client C   (each filtered by its scope)
//! ```
//!
//! One task per connection; a writer task drains the session's outbound
//! channel so fan-out never blocks on a slow socket. A submitted
//! operation runs `authorize_write` → bounded transform-retry against
//! the store → `OpAck` to the author → `notify` on the index, with each
//! resulting event filtered through the receiving session's scope
//! before transmission.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::edit::{CommittedOp, Edit, Operation};
use crate::mediator::{AccessMediator, ShareTokenResolver, StaticShareResolver};
use crate::protocol::{
    ClientFrame, DocSnapshot, ErrorCode, ServerFrame, SHARE_TOKEN_PARAM,
};
use crate::query::{DocChange, Predicate, SubscriptionIndex};
use crate::session::{Session, SessionRegistry};
use crate::store::{AppendOutcome, DocumentStore, StoreError};
use crate::storage::{PersistedStore, StorageConfig};
use crate::transform::transform_operation;
use crate::value::Collection;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frame channel capacity per session
    pub outbound_capacity: usize,
    /// Transform-retry budget per submitted operation
    pub max_transform_retries: u32,
    /// Query setup timeout in seconds
    pub query_timeout_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            max_transform_retries: 8,
            query_timeout_secs: 5,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub ops_accepted: u64,
    pub ops_rejected: u64,
}

/// Per-document dispatch locks. Delivery order on every subscriber
/// channel must equal commit order, so a submission holds its
/// document's dispatch lock from the append through the fan-out —
/// otherwise two submit tasks race between commit and delivery and
/// subscribers observe versions out of order.
struct DispatchLocks {
    locks: RwLock<HashMap<(Collection, String), Arc<Mutex<()>>>>,
}

impl DispatchLocks {
    fn new() -> Self {
        Self { locks: RwLock::new(HashMap::new()) }
    }

    async fn acquire(&self, collection: &Collection, doc_id: &str) -> OwnedMutexGuard<()> {
        let key = (collection.clone(), doc_id.to_string());
        if let Some(lock) = self.locks.read().await.get(&key).cloned() {
            return lock.lock_owned().await;
        }
        let lock = self
            .locks
            .write()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    store: Arc<DocumentStore>,
    index: Arc<SubscriptionIndex>,
    registry: Arc<SessionRegistry>,
    mediator: Arc<AccessMediator>,
    dispatch: Arc<DispatchLocks>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server with the given configuration and share resolver.
    pub fn new(config: ServerConfig, resolver: Arc<dyn ShareTokenResolver>) -> Self {
        // Open persistent storage if configured
        let store = match config.storage_path.as_ref() {
            Some(path) => {
                let storage_config = StorageConfig {
                    path: path.clone(),
                    ..StorageConfig::default()
                };
                let persisted = PersistedStore::open(storage_config)
                    .expect("Failed to open persisted store");
                Arc::new(DocumentStore::with_persistence(Arc::new(persisted)))
            }
            None => Arc::new(DocumentStore::new()),
        };

        Self {
            config,
            store,
            index: Arc::new(SubscriptionIndex::new()),
            registry: Arc::new(SessionRegistry::new()),
            mediator: Arc::new(AccessMediator::new(resolver)),
            dispatch: Arc::new(DispatchLocks::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration and no registered shares.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Arc::new(StaticShareResolver::new()))
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config, Arc::new(StaticShareResolver::new()))
    }

    /// Recover persisted documents from storage on startup.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        self.store.recover().await
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let config = self.config.clone();
            let store = self.store.clone();
            let index = self.index.clone();
            let registry = self.registry.clone();
            let mediator = self.mediator.clone();
            let dispatch = self.dispatch.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream, addr, config, store, index, registry, mediator, dispatch, stats,
                )
                .await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    #[allow(clippy::too_many_arguments)]
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        store: Arc<DocumentStore>,
        index: Arc<SubscriptionIndex>,
        registry: Arc<SessionRegistry>,
        mediator: Arc<AccessMediator>,
        dispatch: Arc<DispatchLocks>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Capture the request URI during the handshake; the share token
        // travels as a query parameter.
        let mut request_uri: Option<String> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            request_uri = Some(req.uri().to_string());
            Ok(resp)
        };
        let mut ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

        let share_token = request_uri.as_deref().and_then(share_token_from_uri);

        // The scope is fixed here, before any session exists. An
        // unresolvable token never gets a session: one error frame,
        // then the transport closes.
        let scope = match mediator.scope_for(share_token.as_deref()) {
            Ok(scope) => scope,
            Err(code) => {
                log::warn!("Rejected connection from {addr}: {code}");
                let frame = ServerFrame::connection_error(code, "share token not recognized");
                ws_stream.send(Message::Binary(frame.encode()?.into())).await?;
                ws_stream.close(None).await?;
                return Ok(());
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<ServerFrame>(config.outbound_capacity);
        let session = Arc::new(Session::new(scope, outbound_tx));
        let session_id = session.session_id;
        registry.register(session.clone()).await;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!(
            "Session {session_id} established from {addr} (scoped: {})",
            session.scope.is_scoped()
        );

        // Writer task: the only code touching the socket's send half, so
        // fan-out from other sessions' tasks never blocks on this socket.
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let encoded = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Failed to encode outbound frame: {e}");
                        continue;
                    }
                };
                if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        // Reader loop: dispatch client frames until the peer goes away.
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    {
                        let mut s = stats.write().await;
                        s.total_frames += 1;
                        s.total_bytes += bytes.len() as u64;
                    }
                    match ClientFrame::decode(&bytes) {
                        Ok(frame) => {
                            Self::dispatch_frame(
                                frame, &session, &config, &store, &index, &mediator,
                                &registry, &dispatch, &stats,
                            )
                            .await;
                        }
                        Err(e) => {
                            log::warn!("Undecodable frame from {addr}: {e}");
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Ok(Message::Ping(data)) => {
                    // tungstenite answers transport pings itself when we
                    // keep reading; queue nothing, just note it.
                    log::trace!("Transport ping from {addr} ({} bytes)", data.len());
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }

        // Teardown: subscriptions and registry entry go; committed
        // operations are unaffected.
        registry.deregister(&session_id).await;
        let removed = index.remove_session(&session_id).await;
        writer.abort();
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        log::info!("Session {session_id} closed ({removed} subscriptions removed)");

        Ok(())
    }

    /// Dispatch one decoded client frame on its session.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_frame(
        frame: ClientFrame,
        session: &Arc<Session>,
        config: &ServerConfig,
        store: &Arc<DocumentStore>,
        index: &Arc<SubscriptionIndex>,
        mediator: &Arc<AccessMediator>,
        registry: &Arc<SessionRegistry>,
        dispatch: &Arc<DispatchLocks>,
        stats: &Arc<RwLock<ServerStats>>,
    ) {
        match frame {
            ClientFrame::Subscribe { request_id, collection, predicate } => {
                // The id is assigned up front so an abandoned setup
                // can be torn down from outside the timed section.
                let subscription_id = Uuid::new_v4();
                let setup = tokio::time::timeout(
                    Duration::from_secs(config.query_timeout_secs),
                    Self::handle_subscribe(
                        request_id, subscription_id, collection, predicate, session, store,
                        index, mediator,
                    ),
                )
                .await;
                match setup {
                    Ok(frame) => {
                        session.send(frame).await;
                    }
                    Err(_) => {
                        log::warn!("Query setup timed out (request {request_id})");
                        Self::abort_subscription(&subscription_id, session, index).await;
                        session
                            .send(ServerFrame::error(
                                request_id,
                                ErrorCode::NotFound,
                                "query setup timed out",
                            ))
                            .await;
                    }
                }
            }

            ClientFrame::Unsubscribe { request_id, subscription_id } => {
                // Only the owning session may tear a subscription down.
                let owner = index.session_of(&subscription_id).await;
                let frame = if owner == Some(session.session_id) {
                    index.unsubscribe(&subscription_id).await;
                    session.untrack_subscription(&subscription_id).await;
                    ServerFrame::Unsubscribed { request_id }
                } else {
                    ServerFrame::error(request_id, ErrorCode::NotFound, "unknown subscription")
                };
                session.send(frame).await;
            }

            ClientFrame::SubmitOp { request_id, collection, doc_id, base_version, op_id, edits } => {
                Self::handle_submit(
                    request_id, collection, doc_id, base_version, op_id, edits, session,
                    config, store, index, mediator, registry, dispatch, stats,
                )
                .await;
            }

            ClientFrame::Ping => {
                session.send(ServerFrame::Pong).await;
            }
        }
    }

    /// Establish one live query and build its initial result set.
    #[allow(clippy::too_many_arguments)]
    async fn handle_subscribe(
        request_id: u64,
        subscription_id: Uuid,
        collection: Collection,
        predicate: Predicate,
        session: &Arc<Session>,
        store: &Arc<DocumentStore>,
        index: &Arc<SubscriptionIndex>,
        mediator: &Arc<AccessMediator>,
    ) -> ServerFrame {
        // Narrow before evaluation so restricted documents never even
        // enter the result set.
        let effective = mediator.authorize_query(&session.scope, &collection, predicate);

        // Register before scanning: a document committed between the
        // two steps then shows up either in the initial set or as an
        // event (possibly both, which subscribers tolerate), never in
        // neither.
        index
            .subscribe_as(subscription_id, session.session_id, collection.clone(), effective, &[])
            .await;
        session.track_subscription(subscription_id).await;

        let initial = store.scan(&collection).await;
        let matching = index.seed(&subscription_id, &initial).await;

        let docs: Vec<DocSnapshot> = initial
            .iter()
            .filter(|(id, _, _)| matching.contains(id))
            .map(|(id, data, version)| DocSnapshot {
                doc_id: id.clone(),
                version: *version,
                data: mediator.filter_snapshot(&session.scope, &collection, data),
            })
            .collect();

        log::debug!(
            "Session {} subscribed to {collection} ({} initial docs)",
            session.session_id,
            docs.len()
        );
        ServerFrame::Subscribed { request_id, subscription_id, collection, docs }
    }

    /// Tear down whatever a timed-out subscription setup left behind.
    /// An error frame must never ride alongside a live subscription.
    async fn abort_subscription(
        subscription_id: &Uuid,
        session: &Arc<Session>,
        index: &Arc<SubscriptionIndex>,
    ) {
        index.unsubscribe(subscription_id).await;
        session.untrack_subscription(subscription_id).await;
    }

    /// Run one submission through authorization, the transform-retry
    /// loop, and fan-out.
    #[allow(clippy::too_many_arguments)]
    async fn handle_submit(
        request_id: u64,
        collection: Collection,
        doc_id: String,
        base_version: u64,
        op_id: Uuid,
        edits: Vec<Edit>,
        session: &Arc<Session>,
        config: &ServerConfig,
        store: &Arc<DocumentStore>,
        index: &Arc<SubscriptionIndex>,
        mediator: &Arc<AccessMediator>,
        registry: &Arc<SessionRegistry>,
        dispatch: &Arc<DispatchLocks>,
        stats: &Arc<RwLock<ServerStats>>,
    ) {
        let mut op = Operation::new(collection, &doc_id, base_version, session.session_id, edits);
        // Replays must reuse the client-assigned id, not a fresh one.
        op.op_id = op_id;

        // Authorization precedes everything: a denied write never
        // reaches the transform engine or any op-log.
        if let Err(code) = mediator.authorize_write(&session.scope, &op) {
            stats.write().await.ops_rejected += 1;
            session
                .send(ServerFrame::error(request_id, code, "operation denied by scope"))
                .await;
            return;
        }

        // Held from the append through the fan-out so subscribers
        // observe this document's versions in commit order.
        let _dispatch = dispatch.acquire(&op.collection, &op.doc_id).await;

        let mut retries = 0;
        let outcome = loop {
            match store.append(op.clone()).await {
                Ok(outcome) => break Ok(outcome),
                Err(StoreError::VersionConflict { current, missed }) => {
                    if missed.is_empty() {
                        // Nothing to transform over: either the base
                        // claims a version from the future, or the
                        // history back to it is no longer retained.
                        let message = if op.base_version > current {
                            format!("base version {} ahead of current {current}", op.base_version)
                        } else {
                            format!(
                                "no committed history since base version {}",
                                op.base_version
                            )
                        };
                        break Err((ErrorCode::VersionConflict, message));
                    }
                    if retries >= config.max_transform_retries {
                        break Err((
                            ErrorCode::Irreconcilable,
                            format!("retry budget exhausted after {retries} transforms"),
                        ));
                    }
                    retries += 1;
                    log::debug!(
                        "Op {} conflicts at v{current}; transforming over {} missed ops (retry {retries})",
                        op.op_id,
                        missed.len()
                    );
                    match transform_operation(op.clone(), &missed) {
                        Ok(rebased) => op = rebased,
                        Err(e) => break Err((ErrorCode::Irreconcilable, e.to_string())),
                    }
                }
                Err(StoreError::NotFound { collection, doc_id }) => {
                    break Err((ErrorCode::NotFound, format!("{collection}/{doc_id}")))
                }
                Err(StoreError::Irreconcilable(reason)) => {
                    break Err((ErrorCode::Irreconcilable, reason))
                }
                Err(StoreError::Persistence(e)) => {
                    log::error!("Storage failure during append: {e}");
                    break Err((ErrorCode::Irreconcilable, "storage failure".to_string()));
                }
            }
        };

        match outcome {
            Ok(AppendOutcome::Applied(committed)) => {
                stats.write().await.ops_accepted += 1;
                session
                    .send(ServerFrame::OpAck { request_id, new_version: committed.version })
                    .await;
                Self::fan_out(&committed, store, index, mediator, registry).await;
            }
            Ok(AppendOutcome::AlreadyApplied { version }) => {
                // Client retry of a committed op: acknowledge, no fan-out.
                session
                    .send(ServerFrame::OpAck { request_id, new_version: version })
                    .await;
            }
            Err((code, message)) => {
                stats.write().await.ops_rejected += 1;
                log::debug!("Op {op_id} rejected: {code} ({message})");
                session.send(ServerFrame::error(request_id, code, message)).await;
            }
        }
    }

    /// Route a committed operation to every matching subscriber, with
    /// each receiving session's scope re-applied before transmission.
    async fn fan_out(
        committed: &CommittedOp,
        store: &Arc<DocumentStore>,
        index: &Arc<SubscriptionIndex>,
        mediator: &Arc<AccessMediator>,
        registry: &Arc<SessionRegistry>,
    ) {
        let collection = &committed.op.collection;
        let doc_id = &committed.op.doc_id;
        let (data, version) = match store.get(collection, doc_id).await {
            Some(current) => current,
            None => return,
        };

        let events = index.notify(collection, doc_id, &data, version).await;
        for event in events {
            let receiver = match registry.get(&event.session_id).await {
                Some(s) => s,
                None => continue,
            };
            let frame = match event.change {
                DocChange::Added { version, data } => ServerFrame::Snapshot {
                    subscription_id: event.subscription_id,
                    collection: event.collection.clone(),
                    doc_id: event.doc_id.clone(),
                    version,
                    data: mediator.filter_snapshot(&receiver.scope, &event.collection, &data),
                },
                DocChange::Changed => ServerFrame::OpApplied {
                    collection: event.collection.clone(),
                    doc_id: event.doc_id.clone(),
                    new_version: committed.version,
                    edits: mediator.filter_edits(
                        &receiver.scope,
                        &event.collection,
                        &committed.op.edits,
                    ),
                },
                DocChange::Removed => ServerFrame::DocRemoved {
                    subscription_id: event.subscription_id,
                    collection: event.collection.clone(),
                    doc_id: event.doc_id.clone(),
                },
            };
            if !receiver.send(frame).await {
                log::debug!("Dropped frame for gone session {}", event.session_id);
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The document store backing this server.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}

/// Extract the share token from a request URI's query string.
fn share_token_from_uri(uri: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == SHARE_TOKEN_PARAM && !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
