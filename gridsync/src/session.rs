//! Per-connection sessions and the explicit session registry.
//!
//! A session owns its immutable [`Scope`] and the outbound frame
//! channel; subscriptions live in the index but are back-referenced
//! here so disconnect can tear them down. The registry is an explicit
//! object handed to the fan-out path — there is no ambient global
//! connection state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::mediator::Scope;
use crate::protocol::ServerFrame;

/// One live connection's state.
pub struct Session {
    pub session_id: Uuid,
    /// Authorization context, fixed at connect time.
    pub scope: Scope,
    /// Ordered delivery stream to this connection's writer task.
    outbound: mpsc::Sender<ServerFrame>,
    /// Subscription handles owned by this session (non-owning
    /// back-references into the index).
    subscriptions: Mutex<HashSet<Uuid>>,
}

impl Session {
    pub fn new(scope: Scope, outbound: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope,
            outbound,
            subscriptions: Mutex::new(HashSet::new()),
        }
    }

    /// Queue a frame for delivery. Returns false when the connection's
    /// writer has gone away (frame dropped, caller cleans up).
    pub async fn send(&self, frame: ServerFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    pub async fn track_subscription(&self, subscription_id: Uuid) {
        self.subscriptions.lock().await.insert(subscription_id);
    }

    pub async fn untrack_subscription(&self, subscription_id: &Uuid) -> bool {
        self.subscriptions.lock().await.remove(subscription_id)
    }

    pub async fn subscription_ids(&self) -> Vec<Uuid> {
        self.subscriptions.lock().await.iter().copied().collect()
    }
}

/// Explicit registry of live sessions, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id, session);
    }

    pub async fn deregister(&self, session_id: &Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id)
    }

    pub async fn get(&self, session_id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
