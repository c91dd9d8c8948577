//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect), optionally under a
//!   share token
//! - Request-id correlated subscribe/unsubscribe/submit
//! - A typed event stream the application consumes
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::edit::Edit;
use crate::protocol::{
    ClientFrame, DocSnapshot, ErrorCode, ProtocolError, ServerFrame, SHARE_TOKEN_PARAM,
};
use crate::query::Predicate;
use crate::value::{Collection, DocData};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A subscription was established; carries the initial result set
    Subscribed {
        request_id: u64,
        subscription_id: Uuid,
        collection: Collection,
        docs: Vec<DocSnapshot>,
    },
    /// A subscription was torn down
    Unsubscribed { request_id: u64 },
    /// A document entered a subscription's result set
    Snapshot {
        subscription_id: Uuid,
        collection: Collection,
        doc_id: String,
        version: u64,
        data: DocData,
    },
    /// An accepted remote (or own) operation
    OpApplied {
        collection: Collection,
        doc_id: String,
        new_version: u64,
        edits: Vec<Edit>,
    },
    /// A document left a subscription's result set
    DocRemoved {
        subscription_id: Uuid,
        collection: Collection,
        doc_id: String,
    },
    /// Our own submission was accepted
    OpAccepted { request_id: u64, new_version: u64 },
    /// A request was rejected (or the connection denied)
    ServerError {
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
    /// Heartbeat response
    Pong,
}

/// The sync client.
///
/// Manages one WebSocket connection to the sync server and translates
/// server frames into [`SyncEvent`]s.
pub struct SyncClient {
    /// Server URL (ws://...)
    server_url: String,

    /// Share token appended to the connection URL, if any
    share_token: Option<String>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Monotonic request-id source
    next_request_id: AtomicU64,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    /// Create a client with full read/write rights.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::build(server_url.into(), None)
    }

    /// Create a client bound to a share token. The resulting connection
    /// carries the scope the server derives from that token.
    pub fn with_share_token(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::build(server_url.into(), Some(token.into()))
    }

    fn build(server_url: String, share_token: Option<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url,
            share_token,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            next_request_id: AtomicU64::new(1),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// The URL the client will dial, including the share token.
    pub fn connection_url(&self) -> String {
        match &self.share_token {
            Some(token) => format!("{}?{SHARE_TOKEN_PARAM}={token}", self.server_url),
            None => self.server_url.clone(),
        }
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.connection_url();
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: translate server frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerFrame::decode(&bytes) {
                            Ok(frame) => {
                                let _ = event_tx.send(Self::frame_to_event(frame)).await;
                            }
                            Err(e) => {
                                log::warn!("Undecodable server frame: {e}");
                            }
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    fn frame_to_event(frame: ServerFrame) -> SyncEvent {
        match frame {
            ServerFrame::Subscribed { request_id, subscription_id, collection, docs } => {
                SyncEvent::Subscribed { request_id, subscription_id, collection, docs }
            }
            ServerFrame::Unsubscribed { request_id } => SyncEvent::Unsubscribed { request_id },
            ServerFrame::Snapshot { subscription_id, collection, doc_id, version, data } => {
                SyncEvent::Snapshot { subscription_id, collection, doc_id, version, data }
            }
            ServerFrame::OpApplied { collection, doc_id, new_version, edits } => {
                SyncEvent::OpApplied { collection, doc_id, new_version, edits }
            }
            ServerFrame::DocRemoved { subscription_id, collection, doc_id } => {
                SyncEvent::DocRemoved { subscription_id, collection, doc_id }
            }
            ServerFrame::OpAck { request_id, new_version } => {
                SyncEvent::OpAccepted { request_id, new_version }
            }
            ServerFrame::Error { request_id, code, message } => {
                SyncEvent::ServerError { request_id, code, message }
            }
            ServerFrame::Pong => SyncEvent::Pong,
        }
    }

    /// Open a live query. Returns the request id to correlate the
    /// `Subscribed` (or `ServerError`) event.
    pub async fn subscribe(
        &self,
        collection: Collection,
        predicate: Predicate,
    ) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        self.send_frame(&ClientFrame::Subscribe { request_id, collection, predicate })
            .await?;
        Ok(request_id)
    }

    /// Tear down a live query.
    pub async fn unsubscribe(&self, subscription_id: Uuid) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        self.send_frame(&ClientFrame::Unsubscribe { request_id, subscription_id })
            .await?;
        Ok(request_id)
    }

    /// Submit an operation. Returns the request id and the client-side
    /// op id (resubmitting with the same op id is safe).
    pub async fn submit_op(
        &self,
        collection: Collection,
        doc_id: impl Into<String>,
        base_version: u64,
        edits: Vec<Edit>,
    ) -> Result<(u64, Uuid), ProtocolError> {
        let op_id = Uuid::new_v4();
        let request_id = self
            .resubmit_op(collection, doc_id, base_version, op_id, edits)
            .await?;
        Ok((request_id, op_id))
    }

    /// Submit with a caller-chosen op id, for retries after a dropped
    /// acknowledgement.
    pub async fn resubmit_op(
        &self,
        collection: Collection,
        doc_id: impl Into<String>,
        base_version: u64,
        op_id: Uuid,
        edits: Vec<Edit>,
    ) -> Result<u64, ProtocolError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        self.send_frame(&ClientFrame::SubmitOp {
            request_id,
            collection,
            doc_id: doc_id.into(),
            base_version,
            op_id,
            edits,
        })
        .await?;
        Ok(request_id)
    }

    /// Send a heartbeat probe.
    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(&ClientFrame::Ping).await
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        let encoded = frame.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL (without the share token).
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Whether this client was created with a share token.
    pub fn is_shared(&self) -> bool {
        self.share_token.is_some()
    }
}
