//! In-process realtime document store.
//!
//! `MemoryBackend` implements `EventBackend` over a map of documents and
//! pushes a fresh snapshot to every live query after each write, the way a
//! hosted realtime store would. It can be told to fail or delay writes,
//! which makes it the backend of choice for demos and tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use groupcal_core::{
    BatchOp, EventBackend, EventOrigin, EventQuery, GroupMembership, LiveQuery, MonthKey,
    QueryUpdate, RawDocument, SyncError, SyncResult,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;

struct Listener {
    query: EventQuery,
    tx: UnboundedSender<QueryUpdate>,
}

#[derive(Default)]
struct State {
    documents: BTreeMap<String, Map<String, Value>>,
    memberships: Vec<GroupMembership>,
    listeners: Vec<Listener>,
    next_id: u64,
    failing_writes: usize,
    failing_fetches: usize,
    write_delay: Option<Duration>,
    ack_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
    fetch_calls: usize,
    listen_calls: usize,
    membership_calls: usize,
}

impl State {
    fn snapshot(&self, query: &EventQuery) -> Vec<RawDocument> {
        self.documents
            .iter()
            .filter(|(_, fields)| query.matches(fields))
            .map(|(id, fields)| RawDocument::new(id.clone(), fields.clone()))
            .collect()
    }

    /// Push the current result set to every live query, dropping closed ones.
    fn broadcast(&mut self) {
        self.listeners.retain(|listener| !listener.tx.is_closed());
        for listener in &self.listeners {
            let _ = listener
                .tx
                .send(QueryUpdate::Snapshot(self.snapshot(&listener.query)));
        }
    }

    fn take_failure(&mut self) -> SyncResult<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(SyncError::Backend("write rejected".into()));
        }
        Ok(())
    }

    fn group_ids_of(&self, user_id: &str) -> Vec<String> {
        self.memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.group_id.clone())
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_membership(&self, group_id: &str, user_id: &str, color: Option<&str>) {
        self.lock().memberships.push(GroupMembership {
            group_id: group_id.to_string(),
            user_id: user_id.to_string(),
            color: color.map(String::from),
        });
    }

    /// Write a document as another client would, notifying live queries.
    pub fn put_document(&self, id: &str, fields: Map<String, Value>) {
        let mut state = self.lock();
        state.documents.insert(id.to_string(), fields);
        state.broadcast();
    }

    pub fn document(&self, id: &str) -> Option<Map<String, Value>> {
        self.lock().documents.get(id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }

    /// Reject the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    /// Reject the next `count` month fetches.
    pub fn fail_next_fetches(&self, count: usize) {
        self.lock().failing_fetches = count;
    }

    /// Hold every write for `delay` before it is applied.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.lock().write_delay = delay;
    }

    /// Let live queries see an applied create for `delay` before the
    /// writer gets its confirmation back.
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        self.lock().ack_delay = delay;
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.lock().fetch_delay = delay;
    }

    /// Deliver `docs` as the next snapshot of every live query with the
    /// given origin, as a lagging replica would.
    pub fn deliver_snapshot(&self, origin: EventOrigin, docs: Vec<RawDocument>) {
        let state = self.lock();
        for listener in state.listeners.iter().filter(|l| l.query.origin() == origin) {
            let _ = listener.tx.send(QueryUpdate::Snapshot(docs.clone()));
        }
    }

    /// Deliver an error to every live query.
    pub fn emit_error(&self, message: &str) {
        let state = self.lock();
        for listener in &state.listeners {
            let _ = listener.tx.send(QueryUpdate::Error(message.to_string()));
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    pub fn listen_calls(&self) -> usize {
        self.lock().listen_calls
    }

    pub fn membership_calls(&self) -> usize {
        self.lock().membership_calls
    }

    /// Live queries whose receiving end is still open.
    pub fn active_listeners(&self) -> usize {
        let mut state = self.lock();
        state.listeners.retain(|listener| !listener.tx.is_closed());
        state.listeners.len()
    }

    async fn write_pause(&self) {
        let delay = self.lock().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl EventBackend for MemoryBackend {
    async fn memberships(&self, user_id: &str) -> SyncResult<Vec<GroupMembership>> {
        let mut state = self.lock();
        state.membership_calls += 1;
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    fn listen(&self, query: EventQuery) -> SyncResult<LiveQuery> {
        let (tx, live) = LiveQuery::channel();
        let mut state = self.lock();
        state.listen_calls += 1;

        let initial = state.snapshot(&query);
        tx.send(QueryUpdate::Snapshot(initial))
            .map_err(|_| SyncError::Backend("listener closed".into()))?;
        state.listeners.push(Listener { query, tx });
        Ok(live)
    }

    async fn fetch_month(&self, user_id: &str, month: MonthKey) -> SyncResult<Vec<RawDocument>> {
        let delay = {
            let mut state = self.lock();
            state.fetch_calls += 1;
            if state.failing_fetches > 0 {
                state.failing_fetches -= 1;
                return Err(SyncError::Backend("fetch unavailable".into()));
            }
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        let group_query = EventQuery::GroupEvents {
            group_ids: state.group_ids_of(user_id),
        };
        let personal_query = EventQuery::PersonalEvents {
            user_id: user_id.to_string(),
        };

        Ok(state
            .documents
            .iter()
            .filter(|(_, fields)| group_query.matches(fields) || personal_query.matches(fields))
            .map(|(id, fields)| RawDocument::new(id.clone(), fields.clone()))
            .filter(|doc| {
                doc.decode(EventOrigin::Local)
                    .is_ok_and(|event| event.overlaps_month(month))
            })
            .collect())
    }

    async fn create_event(&self, fields: Map<String, Value>) -> SyncResult<String> {
        self.write_pause().await;
        let (id, ack_delay) = {
            let mut state = self.lock();
            state.take_failure()?;

            state.next_id += 1;
            let id = format!("evt-{}", state.next_id);
            state.documents.insert(id.clone(), fields);
            state.broadcast();
            (id, state.ack_delay)
        };

        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn update_event(&self, id: &str, fields: Map<String, Value>) -> SyncResult<()> {
        self.write_pause().await;
        let mut state = self.lock();
        state.take_failure()?;

        let document = state
            .documents
            .get_mut(id)
            .ok_or_else(|| SyncError::Backend(format!("no document '{id}'")))?;
        document.extend(fields);
        state.broadcast();
        Ok(())
    }

    async fn delete_event(&self, id: &str) -> SyncResult<()> {
        self.write_pause().await;
        let mut state = self.lock();
        state.take_failure()?;

        state.documents.remove(id);
        state.broadcast();
        Ok(())
    }

    async fn batch_write(&self, ops: Vec<BatchOp>) -> SyncResult<()> {
        self.write_pause().await;
        let mut state = self.lock();
        state.take_failure()?;

        if let Some(missing) = ops.iter().find_map(|op| match op {
            BatchOp::Set { id, .. } if !state.documents.contains_key(id) => Some(id),
            _ => None,
        }) {
            return Err(SyncError::Backend(format!("no document '{missing}'")));
        }

        for op in ops {
            match op {
                BatchOp::Set { id, fields } => {
                    if let Some(document) = state.documents.get_mut(&id) {
                        document.extend(fields);
                    }
                }
                BatchOp::Delete { id } => {
                    state.documents.remove(&id);
                }
            }
        }
        state.broadcast();
        Ok(())
    }
}
