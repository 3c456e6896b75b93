//! Durable FIFO of mutations recorded while offline.
//!
//! Entries are persisted under `offline_queue` before any change to the
//! in-memory copy is kept, so a failed write leaves the queue as it was. A
//! flush replays entries strictly in order and removes them only once their
//! replay succeeded; the first failure stops the flush with that batch and
//! every later entry still queued.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use groupcal_core::{CalendarEvent, EventPatch, KeyValueStorage, SyncResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const OFFLINE_QUEUE_KEY: &str = "offline_queue";

/// Most queued updates and deletes sent in one batched write.
pub const MAX_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuedMutation {
    /// Create `event`; its id is the offline placeholder.
    Add { event: CalendarEvent },
    Update { event_id: String, patch: EventPatch },
    Delete { event_id: String },
}

impl QueuedMutation {
    /// The event this mutation targets.
    pub fn event_id(&self) -> &str {
        match self {
            QueuedMutation::Add { event } => &event.id,
            QueuedMutation::Update { event_id, .. } | QueuedMutation::Delete { event_id } => {
                event_id
            }
        }
    }

    fn is_add(&self) -> bool {
        matches!(self, QueuedMutation::Add { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub entity: EntityKind,
    pub mutation: QueuedMutation,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(mutation: QueuedMutation) -> Self {
        QueueEntry {
            id: Uuid::new_v4().to_string(),
            entity: EntityKind::Event,
            mutation,
            enqueued_at: Utc::now(),
        }
    }
}

/// Result of one flush attempt.
#[derive(Debug, Default, PartialEq)]
pub struct FlushReport {
    pub replayed: usize,
    pub remaining: usize,
    /// Error message of the batch that stopped the flush
    pub failed: Option<String>,
}

/// The next batch to replay: a lone create, whose durable id is needed
/// before anything after it, or a run of updates and deletes.
fn next_batch(entries: &[QueueEntry]) -> Vec<QueueEntry> {
    match entries.first() {
        None => vec![],
        Some(first) if first.mutation.is_add() => vec![first.clone()],
        Some(_) => entries
            .iter()
            .take(MAX_BATCH)
            .take_while(|entry| !entry.mutation.is_add())
            .cloned()
            .collect(),
    }
}

pub struct OfflineQueue<S> {
    storage: Arc<S>,
    /// Loaded lazily from storage on first use
    entries: Mutex<Option<Vec<QueueEntry>>>,
    flushing: Mutex<()>,
}

impl<S: KeyValueStorage> OfflineQueue<S> {
    pub fn new(storage: Arc<S>) -> Self {
        OfflineQueue {
            storage,
            entries: Mutex::new(None),
            flushing: Mutex::new(()),
        }
    }

    async fn loaded(&self) -> SyncResult<MutexGuard<'_, Option<Vec<QueueEntry>>>> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            let entries = match self.storage.get(OFFLINE_QUEUE_KEY).await? {
                Some(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    warn!(error = %e, "discarding unreadable offline queue");
                    vec![]
                }),
                None => vec![],
            };
            *guard = Some(entries);
        }
        Ok(guard)
    }

    async fn persist(&self, entries: &[QueueEntry]) -> SyncResult<()> {
        if entries.is_empty() {
            return self.storage.remove(OFFLINE_QUEUE_KEY).await;
        }
        let content = serde_json::to_string(entries)?;
        self.storage.set(OFFLINE_QUEUE_KEY, content).await
    }

    /// Apply `change` to a copy of the queue, persist it, and only then
    /// adopt it. Returns whatever `change` returned; a `false` from it
    /// means there was nothing to write.
    async fn commit(&self, change: impl FnOnce(&mut Vec<QueueEntry>) -> bool) -> SyncResult<bool> {
        let mut guard = self.loaded().await?;
        let mut next = (*guard).clone().unwrap_or_default();
        if !change(&mut next) {
            return Ok(false);
        }
        self.persist(&next).await?;
        *guard = Some(next);
        Ok(true)
    }

    /// Append a mutation and persist the queue.
    pub async fn enqueue(&self, mutation: QueuedMutation) -> SyncResult<QueueEntry> {
        let entry = QueueEntry::new(mutation);
        self.push(entry.clone()).await?;
        Ok(entry)
    }

    /// Append a prepared entry and persist the queue.
    pub async fn push(&self, entry: QueueEntry) -> SyncResult<()> {
        let entry_id = entry.id.clone();
        let event_id = entry.mutation.event_id().to_string();
        self.commit(|entries| {
            entries.push(entry);
            true
        })
        .await?;

        debug!(%entry_id, %event_id, "queued offline mutation");
        Ok(())
    }

    pub async fn entries(&self) -> SyncResult<Vec<QueueEntry>> {
        Ok(self.loaded().await?.clone().unwrap_or_default())
    }

    pub async fn len(&self) -> SyncResult<usize> {
        Ok(self.loaded().await?.as_ref().map_or(0, Vec::len))
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Fold `patch` into the queued create of an offline-created event.
    /// Returns false when no such create is queued.
    pub async fn amend_pending_add(
        &self,
        offline_id: &str,
        patch: &EventPatch,
    ) -> SyncResult<bool> {
        self.commit(|entries| {
            let pending = entries.iter_mut().find_map(|entry| match &mut entry.mutation {
                QueuedMutation::Add { event } if event.id == offline_id => Some(event),
                _ => None,
            });
            match pending {
                Some(event) => {
                    event.apply_patch(patch);
                    true
                }
                None => false,
            }
        })
        .await
    }

    /// Drop the queued create of an offline-created event, together with
    /// anything else queued against it. Returns false when none was queued.
    pub async fn discard_pending_add(&self, offline_id: &str) -> SyncResult<bool> {
        self.commit(|entries| {
            let before = entries.len();
            entries.retain(|entry| entry.mutation.event_id() != offline_id);
            entries.len() != before
        })
        .await
    }

    /// Wait for any running flush and keep others from starting until the
    /// guard is dropped.
    pub async fn pause_flushing(&self) -> MutexGuard<'_, ()> {
        self.flushing.lock().await
    }

    /// Replay queued entries in order through `replay`, one batch at a time.
    ///
    /// Only one flush runs at a time; a concurrent call waits for the
    /// running one and then replays whatever is left.
    pub async fn flush<F, Fut>(&self, mut replay: F) -> SyncResult<FlushReport>
    where
        F: FnMut(Vec<QueueEntry>) -> Fut,
        Fut: Future<Output = SyncResult<()>>,
    {
        let _flushing = self.flushing.lock().await;
        let mut report = FlushReport::default();

        loop {
            let batch = next_batch(self.loaded().await?.as_deref().unwrap_or_default());
            if batch.is_empty() {
                break;
            }
            let ids: Vec<String> = batch.iter().map(|entry| entry.id.clone()).collect();

            if let Err(e) = replay(batch).await {
                warn!(
                    first_entry = %ids[0],
                    entries = ids.len(),
                    error = %e,
                    "offline replay failed; keeping remaining entries"
                );
                report.failed = Some(e.to_string());
                break;
            }

            // The batch reached the backend; drop it from memory even if
            // persisting the shorter queue fails
            let mut guard = self.loaded().await?;
            let entries = guard.get_or_insert_with(Vec::new);
            entries.retain(|queued| !ids.contains(&queued.id));
            report.replayed += ids.len();
            self.persist(entries).await?;
        }

        report.remaining = self.len().await?;
        if report.replayed > 0 || report.failed.is_some() {
            info!(
                replayed = report.replayed,
                remaining = report.remaining,
                "offline queue flushed"
            );
        }
        Ok(report)
    }

    pub async fn clear(&self) -> SyncResult<()> {
        let mut guard = self.entries.lock().await;
        *guard = Some(vec![]);
        self.storage.remove(OFFLINE_QUEUE_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FlakyStorage, MemoryStorage};
    use chrono::NaiveDate;
    use groupcal_core::{EventDraft, SyncError, offline_id};

    fn queue() -> (Arc<MemoryStorage>, OfflineQueue<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (storage.clone(), OfflineQueue::new(storage))
    }

    fn delete(id: &str) -> QueuedMutation {
        QueuedMutation::Delete {
            event_id: id.to_string(),
        }
    }

    fn add(title: &str) -> QueuedMutation {
        let start = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        QueuedMutation::Add {
            event: EventDraft::new(title, start).into_event(offline_id(), "u1"),
        }
    }

    fn targets(batch: &[QueueEntry]) -> Vec<String> {
        batch
            .iter()
            .map(|e| match &e.mutation {
                QueuedMutation::Add { event } => event.title.clone(),
                other => other.event_id().to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_persists_in_order() {
        let (storage, queue) = queue();
        queue.enqueue(delete("a")).await.unwrap();
        queue.enqueue(delete("b")).await.unwrap();

        let reopened = OfflineQueue::new(storage);
        assert_eq!(targets(&reopened.entries().await.unwrap()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_flush_replays_fifo_in_batches() {
        let (storage, queue) = queue();
        for mutation in [delete("a"), add("Trip"), delete("b"), delete("c")] {
            queue.enqueue(mutation).await.unwrap();
        }

        let mut batches = vec![];
        let report = queue
            .flush(|batch| {
                batches.push(targets(&batch));
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(batches, vec![vec!["a"], vec!["Trip"], vec!["b", "c"]]);
        assert_eq!(report.replayed, 4);
        assert_eq!(report.remaining, 0);
        assert!(storage.get(OFFLINE_QUEUE_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_stops_at_first_failure_without_replaying_twice() {
        let (_, queue) = queue();
        for mutation in [delete("a"), add("Trip"), delete("b")] {
            queue.enqueue(mutation).await.unwrap();
        }

        let mut attempts = vec![];
        let report = queue
            .flush(|batch| {
                let batch = targets(&batch);
                attempts.push(batch.clone());
                async move {
                    if batch == ["Trip"] {
                        Err(SyncError::Backend("timeout".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(attempts, vec![vec!["a"], vec!["Trip"]]);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.remaining, 2);
        assert!(report.failed.is_some());

        let mut retried = vec![];
        queue
            .flush(|batch| {
                retried.push(targets(&batch));
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(retried, vec![vec!["Trip"], vec!["b"]]);
        assert!(queue.is_empty().await.unwrap());
    }

    #[test]
    fn test_batches_are_capped() {
        let entries: Vec<QueueEntry> = (0..MAX_BATCH + 3)
            .map(|i| QueueEntry::new(delete(&format!("e{i}"))))
            .collect();
        assert_eq!(next_batch(&entries).len(), MAX_BATCH);
        assert!(next_batch(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_amend_and_discard_pending_add() {
        let (_, queue) = queue();
        let id = offline_id();
        let start = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        let event = EventDraft::new("Draft", start).into_event(id.clone(), "u1");
        queue.enqueue(QueuedMutation::Add { event }).await.unwrap();

        let patch = EventPatch::title("Final");
        assert!(queue.amend_pending_add(&id, &patch).await.unwrap());
        assert!(!queue.amend_pending_add("offline_other", &patch).await.unwrap());

        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        match &entries[0].mutation {
            QueuedMutation::Add { event } => assert_eq!(event.title, "Final"),
            other => panic!("unexpected mutation {other:?}"),
        }

        assert!(queue.discard_pending_add(&id).await.unwrap());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_queue_unchanged() {
        let storage = Arc::new(FlakyStorage::default());
        let queue = OfflineQueue::new(storage.clone());
        let id = offline_id();
        let start = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        let event = EventDraft::new("Draft", start).into_event(id.clone(), "u1");
        queue.enqueue(QueuedMutation::Add { event }).await.unwrap();

        storage.fail_writes(true);
        assert!(queue.enqueue(delete("a")).await.is_err());
        assert!(queue.amend_pending_add(&id, &EventPatch::title("x")).await.is_err());
        assert!(queue.discard_pending_add(&id).await.is_err());

        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(targets(&entries), vec!["Draft"]);
    }

    #[tokio::test]
    async fn test_corrupt_queue_reads_as_empty() {
        let (storage, queue) = queue();
        storage
            .set(OFFLINE_QUEUE_KEY, "not json".into())
            .await
            .unwrap();
        assert!(queue.is_empty().await.unwrap());
    }
}
