//! Capabilities the engine consumes from its host.
//!
//! The engine has no wire protocol or storage format of its own. A host
//! plugs in a realtime document store (`EventBackend`), a durable string
//! key-value store (`KeyValueStorage`), a connectivity signal and an auth
//! provider. Async methods return `impl Future + Send` so implementations
//! can be network-backed.

use std::future::Future;
use std::sync::RwLock;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::document::RawDocument;
use crate::error::SyncResult;
use crate::event::{EventOrigin, GroupMembership, PERSONAL_GROUP};
use crate::month::MonthKey;

// ============================================================================
// Realtime document store
// ============================================================================

/// The two live queries a signed-in user holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventQuery {
    /// Events whose `groupId` is one of the user's groups.
    GroupEvents { group_ids: Vec<String> },
    /// Events owned by the user in the personal group.
    PersonalEvents { user_id: String },
}

impl EventQuery {
    /// The origin tag given to every event this query delivers.
    pub fn origin(&self) -> EventOrigin {
        match self {
            EventQuery::GroupEvents { .. } => EventOrigin::Group,
            EventQuery::PersonalEvents { .. } => EventOrigin::Personal,
        }
    }

    /// Field-equality/membership filter, usable by in-process backends.
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        let field = |name: &str| fields.get(name).and_then(Value::as_str);
        match self {
            EventQuery::GroupEvents { group_ids } => {
                field("groupId").is_some_and(|g| group_ids.iter().any(|id| id == g))
            }
            EventQuery::PersonalEvents { user_id } => {
                field("userId") == Some(user_id.as_str())
                    && field("groupId").unwrap_or(PERSONAL_GROUP) == PERSONAL_GROUP
            }
        }
    }
}

/// One delivery from a live query.
#[derive(Debug, Clone)]
pub enum QueryUpdate {
    /// The full current result set of the query.
    Snapshot(Vec<RawDocument>),
    /// The query failed; the listener may still deliver later snapshots.
    Error(String),
}

/// Receiving end of a live query. Dropping it cancels the listener.
#[derive(Debug)]
pub struct LiveQuery {
    updates: mpsc::UnboundedReceiver<QueryUpdate>,
}

impl LiveQuery {
    /// Create a connected sender/query pair. Backends keep the sender and
    /// should stop delivering once `is_closed()` reports the query dropped.
    pub fn channel() -> (mpsc::UnboundedSender<QueryUpdate>, LiveQuery) {
        let (tx, updates) = mpsc::unbounded_channel();
        (tx, LiveQuery { updates })
    }

    /// Wait for the next update. `None` once the backend hangs up.
    pub async fn next(&mut self) -> Option<QueryUpdate> {
        self.updates.recv().await
    }
}

/// Realtime document store holding events and group memberships.
pub trait EventBackend: Send + Sync + 'static {
    /// The user's group memberships (one record per group).
    fn memberships(
        &self,
        user_id: &str,
    ) -> impl Future<Output = SyncResult<Vec<GroupMembership>>> + Send;

    /// Open a live query. The current result set is delivered as the first
    /// snapshot, followed by a new snapshot on every change.
    fn listen(&self, query: EventQuery) -> SyncResult<LiveQuery>;

    /// One-shot read of every event visible to `user_id` that overlaps `month`.
    fn fetch_month(
        &self,
        user_id: &str,
        month: MonthKey,
    ) -> impl Future<Output = SyncResult<Vec<RawDocument>>> + Send;

    /// Create a document and return its durable id.
    fn create_event(
        &self,
        fields: Map<String, Value>,
    ) -> impl Future<Output = SyncResult<String>> + Send;

    fn update_event(
        &self,
        id: &str,
        fields: Map<String, Value>,
    ) -> impl Future<Output = SyncResult<()>> + Send;

    fn delete_event(&self, id: &str) -> impl Future<Output = SyncResult<()>> + Send;

    /// Apply several writes. Backends that support it should apply the batch
    /// atomically; the default runs each op in order and stops at the first
    /// failure.
    fn batch_write(&self, ops: Vec<BatchOp>) -> impl Future<Output = SyncResult<()>> + Send {
        async move {
            for op in ops {
                match op {
                    BatchOp::Set { id, fields } => self.update_event(&id, fields).await?,
                    BatchOp::Delete { id } => self.delete_event(&id).await?,
                }
            }
            Ok(())
        }
    }
}

/// One write inside `EventBackend::batch_write`.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Merge `fields` into the existing document.
    Set { id: String, fields: Map<String, Value> },
    Delete { id: String },
}

// ============================================================================
// Durable key-value storage
// ============================================================================

/// String-valued durable storage (one value per key).
pub trait KeyValueStorage: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = SyncResult<Option<String>>> + Send;

    fn set(&self, key: &str, value: String) -> impl Future<Output = SyncResult<()>> + Send;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> impl Future<Output = SyncResult<()>> + Send;

    fn all_keys(&self) -> impl Future<Output = SyncResult<Vec<String>>> + Send;

    /// Batch remove - default impl calls remove() in sequence.
    fn multi_remove(&self, keys: &[String]) -> impl Future<Output = SyncResult<()>> + Send {
        let keys = keys.to_vec();
        async move {
            for key in &keys {
                self.remove(key).await?;
            }
            Ok(())
        }
    }
}

// ============================================================================
// Connectivity
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Source of connected/disconnected transitions.
pub trait ConnectivityObserver: Send + Sync + 'static {
    fn watch(&self) -> watch::Receiver<Connectivity>;

    fn is_online(&self) -> bool {
        *self.watch().borrow() == Connectivity::Online
    }
}

/// A connectivity signal driven by the host (or by tests).
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<Connectivity>,
}

impl ManualConnectivity {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _) = watch::channel(initial);
        ManualConnectivity { tx }
    }

    pub fn set(&self, state: Connectivity) {
        self.tx.send_replace(state);
    }
}

impl ConnectivityObserver for ManualConnectivity {
    fn watch(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    fn is_online(&self) -> bool {
        *self.tx.borrow() == Connectivity::Online
    }
}

// ============================================================================
// Auth
// ============================================================================

/// Supplies the signed-in user. Sessions are managed elsewhere.
pub trait AuthProvider: Send + Sync + 'static {
    fn current_user_id(&self) -> Option<String>;
}

/// An auth provider holding a settable user id.
#[derive(Debug, Default)]
pub struct StaticAuth {
    user_id: RwLock<Option<String>>,
}

impl StaticAuth {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        StaticAuth {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        if let Ok(mut guard) = self.user_id.write() {
            *guard = Some(user_id.into());
        }
    }

    pub fn sign_out(&self) {
        if let Ok(mut guard) = self.user_id.write() {
            *guard = None;
        }
    }
}

impl AuthProvider for StaticAuth {
    fn current_user_id(&self) -> Option<String> {
        self.user_id.read().ok().and_then(|guard| guard.clone())
    }
}
