//! Persistent month-bucketed event cache.
//!
//! Each user's events are stored as one JSON bucket per month under
//! `events_cache:<user>:<YYYY-MM>`, keyed by the month of the event's start
//! date. Buckets older than the retention window are skipped on save and
//! pruned by `cleanup`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use groupcal_core::{CalendarEvent, EventIdKind, KeyValueStorage, MonthKey, SyncResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::offline_queue::OFFLINE_QUEUE_KEY;

const BUCKET_PREFIX: &str = "events_cache:";
const LAST_SYNC_PREFIX: &str = "last_sync:";

#[derive(Serialize, Deserialize)]
struct Bucket {
    saved_at: DateTime<Utc>,
    events: Vec<CalendarEvent>,
}

fn bucket_key(user_id: &str, month: MonthKey) -> String {
    format!("{BUCKET_PREFIX}{user_id}:{month}")
}

fn last_sync_key(user_id: &str) -> String {
    format!("{LAST_SYNC_PREFIX}{user_id}")
}

/// Split a bucket key into its user id and month.
fn parse_bucket_key(key: &str) -> Option<(&str, MonthKey)> {
    let rest = key.strip_prefix(BUCKET_PREFIX)?;
    let (user_id, month) = rest.rsplit_once(':')?;
    Some((user_id, month.parse().ok()?))
}

pub struct CacheManager<S> {
    storage: Arc<S>,
    retention_months: u32,
}

impl<S: KeyValueStorage> CacheManager<S> {
    pub fn new(storage: Arc<S>, retention_months: u32) -> Self {
        CacheManager {
            storage,
            retention_months,
        }
    }

    /// Oldest month kept in the cache.
    pub fn retention_cutoff(&self) -> MonthKey {
        MonthKey::current().minus_months(self.retention_months)
    }

    /// Months for which `user_id` has a bucket, oldest first.
    async fn bucket_months(&self, user_id: &str) -> SyncResult<BTreeSet<MonthKey>> {
        Ok(self
            .storage
            .all_keys()
            .await?
            .iter()
            .filter_map(|key| parse_bucket_key(key))
            .filter(|(owner, _)| *owner == user_id)
            .map(|(_, month)| month)
            .collect())
    }

    /// Replace the user's cached events with `events`.
    ///
    /// Placeholders for in-flight writes are not persisted; offline-created
    /// events are, since they live until their queued create is replayed.
    pub async fn save(&self, user_id: &str, events: &[CalendarEvent]) -> SyncResult<()> {
        let cutoff = self.retention_cutoff();

        let mut buckets: BTreeMap<MonthKey, Vec<CalendarEvent>> = BTreeMap::new();
        for event in events {
            if event.id_kind() == EventIdKind::Temporary {
                continue;
            }
            let month = MonthKey::from_date(event.start_date);
            if month < cutoff {
                continue;
            }
            buckets.entry(month).or_default().push(event.clone());
        }

        let stale: Vec<String> = self
            .bucket_months(user_id)
            .await?
            .into_iter()
            .filter(|month| *month >= cutoff && !buckets.contains_key(month))
            .map(|month| bucket_key(user_id, month))
            .collect();
        if !stale.is_empty() {
            self.storage.multi_remove(&stale).await?;
        }

        let saved_at = Utc::now();
        let months = buckets.len();
        for (month, events) in buckets {
            let content = serde_json::to_string(&Bucket { saved_at, events })?;
            self.storage
                .set(&bucket_key(user_id, month), content)
                .await?;
        }

        self.storage
            .set(&last_sync_key(user_id), saved_at.to_rfc3339())
            .await?;

        debug!(user_id, months, removed = stale.len(), "saved event cache");
        Ok(())
    }

    /// Every cached event of the user inside the retention window.
    pub async fn load(&self, user_id: &str) -> SyncResult<Vec<CalendarEvent>> {
        let cutoff = self.retention_cutoff();

        let mut events = vec![];
        for month in self.bucket_months(user_id).await? {
            if month < cutoff {
                continue;
            }
            events.extend(self.read_bucket(user_id, month).await?);
        }
        Ok(events)
    }

    /// Cached events overlapping `month`.
    ///
    /// Buckets are keyed by start month, so every retained bucket up to
    /// `month` is read to catch events that began earlier and run into it.
    pub async fn load_month(
        &self,
        user_id: &str,
        month: MonthKey,
    ) -> SyncResult<Vec<CalendarEvent>> {
        let cutoff = self.retention_cutoff();

        let mut events = vec![];
        for bucket in self.bucket_months(user_id).await? {
            if bucket < cutoff || bucket > month {
                continue;
            }
            let cached = self.read_bucket(user_id, bucket).await?;
            events.extend(cached.into_iter().filter(|e| e.overlaps_month(month)));
        }
        Ok(events)
    }

    /// A single month's bucket. A corrupt bucket reads as empty.
    async fn read_bucket(&self, user_id: &str, month: MonthKey) -> SyncResult<Vec<CalendarEvent>> {
        let key = bucket_key(user_id, month);
        let Some(content) = self.storage.get(&key).await? else {
            return Ok(vec![]);
        };

        match serde_json::from_str::<Bucket>(&content) {
            Ok(bucket) => Ok(bucket.events),
            Err(e) => {
                warn!(%key, error = %e, "discarding unreadable cache bucket");
                Ok(vec![])
            }
        }
    }

    /// Delete the user's buckets older than the retention window.
    pub async fn cleanup(&self, user_id: &str) -> SyncResult<usize> {
        let cutoff = self.retention_cutoff();
        let expired: Vec<String> = self
            .bucket_months(user_id)
            .await?
            .into_iter()
            .filter(|month| *month < cutoff)
            .map(|month| bucket_key(user_id, month))
            .collect();

        if !expired.is_empty() {
            self.storage.multi_remove(&expired).await?;
            debug!(user_id, removed = expired.len(), "pruned expired cache buckets");
        }
        Ok(expired.len())
    }

    pub async fn last_sync(&self, user_id: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let value = self.storage.get(&last_sync_key(user_id)).await?;
        Ok(value
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Wipe every bucket, every sync timestamp and the offline queue.
    pub async fn clear_all(&self) -> SyncResult<()> {
        let keys: Vec<String> = self
            .storage
            .all_keys()
            .await?
            .into_iter()
            .filter(|key| {
                key.starts_with(BUCKET_PREFIX)
                    || key.starts_with(LAST_SYNC_PREFIX)
                    || key == OFFLINE_QUEUE_KEY
            })
            .collect();

        self.storage.multi_remove(&keys).await?;
        debug!(removed = keys.len(), "cleared persistent cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use groupcal_core::EventDraft;

    fn event_in(id: &str, month: MonthKey) -> CalendarEvent {
        EventDraft::new(format!("Event {id}"), month.first_day()).into_event(id.into(), "u1")
    }

    fn manager() -> (Arc<MemoryStorage>, CacheManager<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (storage.clone(), CacheManager::new(storage, 3))
    }

    #[tokio::test]
    async fn test_save_buckets_by_start_month_and_loads_back() {
        let (storage, cache) = manager();
        let this_month = MonthKey::current();
        let next_month = this_month.next();

        cache
            .save(
                "u1",
                &[
                    event_in("a", this_month),
                    event_in("b", next_month),
                    event_in("c", this_month),
                ],
            )
            .await
            .unwrap();

        let keys = storage.all_keys().await.unwrap();
        assert!(keys.contains(&bucket_key("u1", this_month)));
        assert!(keys.contains(&bucket_key("u1", next_month)));

        let ids: Vec<String> = cache
            .load("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        let month_ids: Vec<String> = cache
            .load_month("u1", next_month)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(month_ids, vec!["b"]);
        assert!(cache.last_sync("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_save_skips_old_months_and_temp_ids() {
        let (storage, cache) = manager();
        let old = MonthKey::current().minus_months(4);
        let mut in_flight = event_in("x", MonthKey::current());
        in_flight.id = "temp_123".into();

        cache
            .save("u1", &[event_in("old", old), in_flight])
            .await
            .unwrap();

        assert!(storage.get(&bucket_key("u1", old)).await.unwrap().is_none());
        assert!(cache.load("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_removes_emptied_buckets() {
        let (_, cache) = manager();
        let month = MonthKey::current();
        cache.save("u1", &[event_in("a", month)]).await.unwrap();
        cache.save("u1", &[]).await.unwrap();

        assert!(cache.load_month("u1", month).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_bucket_reads_as_empty() {
        let (storage, cache) = manager();
        let month = MonthKey::current();
        storage
            .set(&bucket_key("u1", month), "{not json".into())
            .await
            .unwrap();

        assert!(cache.load_month("u1", month).await.unwrap().is_empty());
        assert!(cache.load("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_prunes_only_expired_buckets_of_user() {
        let (storage, cache) = manager();
        let old = MonthKey::current().minus_months(5);
        let recent = MonthKey::current();
        for key in [
            bucket_key("u1", old),
            bucket_key("u1", recent),
            bucket_key("u2", old),
        ] {
            storage.set(&key, "{}".into()).await.unwrap();
        }

        assert_eq!(cache.cleanup("u1").await.unwrap(), 1);

        let keys = storage.all_keys().await.unwrap();
        assert!(!keys.contains(&bucket_key("u1", old)));
        assert!(keys.contains(&bucket_key("u1", recent)));
        assert!(keys.contains(&bucket_key("u2", old)));
    }

    #[tokio::test]
    async fn test_clear_all_wipes_buckets_sync_and_queue() {
        let (storage, cache) = manager();
        cache
            .save("u1", &[event_in("a", MonthKey::current())])
            .await
            .unwrap();
        storage.set(OFFLINE_QUEUE_KEY, "[]".into()).await.unwrap();
        storage.set("unrelated", "keep".into()).await.unwrap();

        cache.clear_all().await.unwrap();

        assert_eq!(storage.all_keys().await.unwrap(), vec!["unrelated"]);
        assert!(cache.last_sync("u1").await.unwrap().is_none());
    }

    #[test]
    fn test_parse_bucket_key_with_colon_in_user_id() {
        let month = MonthKey::new(2025, 4).unwrap();
        let key = bucket_key("tenant:u1", month);
        assert_eq!(parse_bucket_key(&key), Some(("tenant:u1", month)));
        assert_eq!(parse_bucket_key("last_sync:u1"), None);
    }

    #[tokio::test]
    async fn test_load_month_includes_events_started_in_earlier_month() {
        let (_, cache) = manager();
        let this_month = MonthKey::current();
        let next_month = this_month.next();

        let mut spanning = event_in("spanning", this_month);
        spanning.start_date = this_month.last_day();
        spanning.end_date = next_month.first_day();
        spanning.normalize();
        cache
            .save("u1", &[spanning, event_in("early", this_month)])
            .await
            .unwrap();

        let ids: Vec<String> = cache
            .load_month("u1", next_month)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["spanning"]);
        assert!(cache.load_month("u1", this_month.next().next()).await.unwrap().is_empty());
    }
}
