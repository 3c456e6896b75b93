//! Optimistic writes against the event store.
//!
//! Every mutation is applied to the store first and then sent to the
//! backend. A confirmed create swaps its temporary id for the durable one in
//! a single store update; a failed write restores exactly what was there
//! before. While offline, mutations are recorded in the offline queue and
//! replayed by `flush` once connectivity returns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use groupcal_core::{
    AuthProvider, BatchOp, CalendarEvent, ConnectivityObserver, EventBackend, EventDraft,
    EventIdKind, EventOrigin, EventPatch, KeyValueStorage, MonthKey, SyncError, SyncResult,
    event_fields, offline_id, patch_fields, temp_id,
};
use tokio::sync::MutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::colors::GroupColorResolver;
use crate::month_cache::{MonthCache, MonthCacheKey};
use crate::offline_queue::{FlushReport, OfflineQueue, QueueEntry, QueuedMutation};
use crate::store::{EventStore, HeldChange};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The backend accepted the event under this durable id.
    Created { id: String },
    /// Offline: the event is shown under `offline_id` until replay.
    Queued { offline_id: String },
    /// An identical add was submitted within the guard window.
    Duplicate,
}

type SubmissionKey = (String, NaiveDate, String);

/// Rejects an add that repeats `(title, start_date, group_id)` of another
/// add submitted less than `window` ago.
pub struct DuplicateGuard {
    window: Duration,
    recent: Mutex<HashMap<SubmissionKey, Instant>>,
}

impl DuplicateGuard {
    pub fn new(window: Duration) -> Self {
        DuplicateGuard {
            window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubmissionKey, Instant>> {
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn key(draft: &EventDraft) -> SubmissionKey {
        (
            draft.title.clone(),
            draft.start_date,
            draft.group_id().to_string(),
        )
    }

    /// Record the submission. Returns false if it repeats a recent one.
    pub fn admit(&self, draft: &EventDraft) -> bool {
        let now = Instant::now();
        let mut recent = self.lock();
        recent.retain(|_, at| now.duration_since(*at) < self.window);

        let key = Self::key(draft);
        if recent.contains_key(&key) {
            return false;
        }
        recent.insert(key, now);
        true
    }

    /// Forget a submission so a retry after a failed write is not rejected.
    pub fn release(&self, draft: &EventDraft) {
        self.lock().remove(&Self::key(draft));
    }
}

pub struct MutationCoordinator<B, S> {
    backend: Arc<B>,
    store: EventStore,
    queue: Arc<OfflineQueue<S>>,
    month_cache: Arc<MonthCache>,
    colors: Arc<GroupColorResolver>,
    connectivity: Arc<dyn ConnectivityObserver>,
    auth: Arc<dyn AuthProvider>,
    guard: DuplicateGuard,
}

impl<B: EventBackend, S: KeyValueStorage> MutationCoordinator<B, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<B>,
        store: EventStore,
        queue: Arc<OfflineQueue<S>>,
        month_cache: Arc<MonthCache>,
        colors: Arc<GroupColorResolver>,
        connectivity: Arc<dyn ConnectivityObserver>,
        auth: Arc<dyn AuthProvider>,
        duplicate_window: Duration,
    ) -> Self {
        MutationCoordinator {
            backend,
            store,
            queue,
            month_cache,
            colors,
            connectivity,
            auth,
            guard: DuplicateGuard::new(duplicate_window),
        }
    }

    fn invalidate_months(&self, months: impl IntoIterator<Item = MonthKey>) {
        let Some(user_id) = self.auth.current_user_id() else {
            return;
        };
        for month in months {
            self.month_cache
                .invalidate(&MonthCacheKey::new(user_id.as_str(), month));
        }
    }

    /// Create an event, showing it immediately.
    pub async fn add(&self, draft: EventDraft) -> SyncResult<AddOutcome> {
        let user_id = self.auth.current_user_id().ok_or(SyncError::NotSignedIn)?;

        if !self.guard.admit(&draft) {
            debug!(
                title = %draft.title,
                start = %draft.start_date,
                "ignoring duplicate submission"
            );
            return Ok(AddOutcome::Duplicate);
        }

        if !self.connectivity.is_online() {
            let id = offline_id();
            let mut event = draft.clone().into_event(id.clone(), &user_id);
            event.is_offline_created = true;
            event.offline_id = Some(id.clone());
            event.client_ref = Some(id.clone());
            self.colors.apply_to(&mut event);

            self.store.upsert(event.clone());
            self.invalidate_months(event.months());
            if let Err(e) = self.queue.enqueue(QueuedMutation::Add { event }).await {
                self.store.remove(&id);
                self.guard.release(&draft);
                warn!(offline_id = %id, error = %e, "could not queue offline create; rolled back");
                return Err(e);
            }
            info!(offline_id = %id, "queued event created offline");
            return Ok(AddOutcome::Queued { offline_id: id });
        }

        let temp = temp_id();
        let mut event = draft.clone().into_event(temp.clone(), &user_id);
        event.client_ref = Some(temp.clone());
        self.colors.apply_to(&mut event);

        self.store.upsert(event.clone());
        self.invalidate_months(event.months());

        let written = match event_fields(&event) {
            Ok(fields) => self.backend.create_event(fields).await,
            Err(e) => Err(e),
        };
        match written {
            Ok(id) => {
                let mut confirmed = event;
                confirmed.id = id.clone();
                confirmed.origin = EventOrigin::for_group(&confirmed.group_id);
                if !self.store.replace(&temp, confirmed) {
                    debug!(temp_id = %temp, %id, "placeholder gone before create confirmed");
                }
                debug!(temp_id = %temp, %id, "event created");
                Ok(AddOutcome::Created { id })
            }
            Err(e) => {
                self.store.remove(&temp);
                self.guard.release(&draft);
                warn!(temp_id = %temp, error = %e, "create failed; rolled back");
                Err(SyncError::WriteFailure(e.to_string()))
            }
        }
    }

    /// Reject temporary ids, and wait out a flush that may be replaying the
    /// create behind an offline id. Returns the id the event is stored
    /// under now, with the flush kept paused while the guard lives.
    async fn resolve(&self, id: &str) -> SyncResult<(String, Option<MutexGuard<'_, ()>>)> {
        match EventIdKind::of(id) {
            EventIdKind::Temporary => Err(SyncError::PendingWrite(id.to_string())),
            EventIdKind::Durable => Ok((id.to_string(), None)),
            EventIdKind::Offline => {
                let paused = self.queue.pause_flushing().await;
                let current = self
                    .store
                    .find_offline_created(id)
                    .map_or_else(|| id.to_string(), |event| event.id);
                Ok((current, Some(paused)))
            }
        }
    }

    /// Apply `patch` to an event. On any failure the event is restored
    /// exactly as it was.
    pub async fn update(&self, id: &str, patch: EventPatch) -> SyncResult<()> {
        let (id, _paused) = self.resolve(id).await?;
        let id = id.as_str();
        let snapshot = self
            .store
            .get(id)
            .ok_or_else(|| SyncError::EventNotFound(id.to_string()))?;

        let mut updated = snapshot.clone();
        updated.apply_patch(&patch);
        self.colors.apply_to(&mut updated);
        self.store.upsert(updated.clone());
        self.invalidate_months(snapshot.months().into_iter().chain(updated.months()));

        let outcome = if EventIdKind::of(id) == EventIdKind::Offline {
            // Never reached the backend: fold the edit into its queued create
            match self.queue.amend_pending_add(id, &patch).await {
                Ok(true) => Ok(()),
                Ok(false) => {
                    warn!(id, "no queued create for offline event; keeping edit local");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else if !self.connectivity.is_online() {
            let entry = QueueEntry::new(QueuedMutation::Update {
                event_id: id.to_string(),
                patch: patch.clone(),
            });
            let entry_id = entry.id.clone();
            self.store.hold(&entry_id, id, HeldChange::Patch(patch));
            let queued = self.queue.push(entry).await;
            if queued.is_err() {
                self.store.release(&entry_id);
            }
            queued
        } else {
            self.backend
                .update_event(id, patch_fields(&patch))
                .await
                .map_err(|e| SyncError::WriteFailure(e.to_string()))
        };

        if let Err(e) = outcome {
            self.store.upsert(snapshot);
            warn!(id, error = %e, "update failed; rolled back");
            return Err(e);
        }
        Ok(())
    }

    /// Delete an event. On any failure it is put back.
    pub async fn remove(&self, id: &str) -> SyncResult<()> {
        let (id, _paused) = self.resolve(id).await?;
        let id = id.as_str();
        let snapshot = self
            .store
            .remove(id)
            .ok_or_else(|| SyncError::EventNotFound(id.to_string()))?;
        self.invalidate_months(snapshot.months());

        let outcome = if EventIdKind::of(id) == EventIdKind::Offline {
            self.queue.discard_pending_add(id).await.map(|_| ())
        } else if !self.connectivity.is_online() {
            let entry = QueueEntry::new(QueuedMutation::Delete {
                event_id: id.to_string(),
            });
            let entry_id = entry.id.clone();
            self.store.hold(&entry_id, id, HeldChange::Delete);
            let queued = self.queue.push(entry).await;
            if queued.is_err() {
                self.store.release(&entry_id);
            }
            queued
        } else {
            self.backend
                .delete_event(id)
                .await
                .map_err(|e| SyncError::WriteFailure(e.to_string()))
        };

        if let Err(e) = outcome {
            self.store.upsert(snapshot);
            warn!(id, error = %e, "delete failed; rolled back");
            return Err(e);
        }
        Ok(())
    }

    /// Re-hold the updates and deletes of a queue loaded from storage, so
    /// live snapshots do not undo them before they are replayed.
    pub async fn restore_held(&self) -> SyncResult<usize> {
        let mut held = 0;
        for entry in self.queue.entries().await? {
            match entry.mutation {
                QueuedMutation::Update { event_id, patch } => {
                    self.store.hold(&entry.id, &event_id, HeldChange::Patch(patch));
                }
                QueuedMutation::Delete { event_id } => {
                    self.store.hold(&entry.id, &event_id, HeldChange::Delete);
                }
                QueuedMutation::Add { .. } => continue,
            }
            held += 1;
        }
        Ok(held)
    }

    /// Send one batch of queued mutations to the backend.
    pub async fn replay(&self, batch: Vec<QueueEntry>) -> SyncResult<()> {
        let mut ops = Vec::with_capacity(batch.len());
        let mut touched = vec![];

        for entry in &batch {
            match &entry.mutation {
                QueuedMutation::Add { event } => return self.replay_add(event.clone()).await,
                QueuedMutation::Update { event_id, patch } => {
                    ops.push(BatchOp::Set {
                        id: event_id.clone(),
                        fields: patch_fields(patch),
                    });
                    touched.push(event_id.clone());
                }
                QueuedMutation::Delete { event_id } => {
                    ops.push(BatchOp::Delete {
                        id: event_id.clone(),
                    });
                    touched.push(event_id.clone());
                }
            }
        }

        self.backend.batch_write(ops).await?;
        for entry in &batch {
            self.store.release(&entry.id);
        }
        if let Some(user_id) = self.auth.current_user_id() {
            self.month_cache.invalidate_user(&user_id);
        }
        debug!(entries = batch.len(), events = ?touched, "replayed offline changes");
        Ok(())
    }

    async fn replay_add(&self, event: CalendarEvent) -> SyncResult<()> {
        let offline = event.id.clone();
        let id = self.backend.create_event(event_fields(&event)?).await?;
        self.invalidate_months(event.months());

        let mut confirmed = event;
        confirmed.id = id.clone();
        confirmed.origin = EventOrigin::for_group(&confirmed.group_id);
        self.colors.apply_to(&mut confirmed);
        if self.store.replace(&offline, confirmed) {
            debug!(offline_id = %offline, %id, "replayed offline create");
        } else {
            warn!(offline_id = %offline, %id, "offline event vanished during replay");
        }
        Ok(())
    }

    /// Replay the offline queue in order. Does nothing while offline.
    pub async fn flush(&self) -> SyncResult<FlushReport> {
        if !self.connectivity.is_online() {
            return Ok(FlushReport {
                remaining: self.queue.len().await?,
                ..Default::default()
            });
        }
        self.queue.flush(|batch| self.replay(batch)).await
    }
}
