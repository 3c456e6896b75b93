//! Short-lived in-memory cache of per-month event lists.
//!
//! A fetch for a key first parks a `Loading` sentinel under that key.
//! Concurrent callers for the same key find the sentinel and wait for the
//! first caller's outcome instead of fetching again. The sentinel is
//! replaced by the result on success and removed on failure, or when the
//! loading future is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use groupcal_core::{CalendarEvent, MonthKey, SyncError, SyncResult};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MonthCacheKey {
    pub user_id: String,
    pub month: MonthKey,
}

impl MonthCacheKey {
    pub fn new(user_id: impl Into<String>, month: MonthKey) -> Self {
        MonthCacheKey {
            user_id: user_id.into(),
            month,
        }
    }
}

type LoadOutcome = Option<Result<Arc<Vec<CalendarEvent>>, String>>;

enum Slot {
    Ready {
        events: Arc<Vec<CalendarEvent>>,
        stored_at: Instant,
    },
    Loading(watch::Receiver<LoadOutcome>),
}

pub struct MonthCache {
    ttl: Duration,
    slots: Mutex<HashMap<MonthCacheKey, Slot>>,
}

enum Role {
    Cached(Vec<CalendarEvent>),
    Wait(watch::Receiver<LoadOutcome>),
    Load(watch::Sender<LoadOutcome>, watch::Receiver<LoadOutcome>),
}

impl MonthCache {
    pub fn new(ttl: Duration) -> Self {
        MonthCache {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MonthCacheKey, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The cached events for `key`, if present and younger than the TTL.
    pub fn get(&self, key: &MonthCacheKey) -> Option<Vec<CalendarEvent>> {
        match self.lock().get(key) {
            Some(Slot::Ready { events, stored_at }) if stored_at.elapsed() < self.ttl => {
                Some(events.to_vec())
            }
            _ => None,
        }
    }

    pub fn set(&self, key: MonthCacheKey, events: Vec<CalendarEvent>, stored_at: Instant) {
        self.lock().insert(
            key,
            Slot::Ready {
                events: Arc::new(events),
                stored_at,
            },
        );
    }

    pub fn is_loading(&self, key: &MonthCacheKey) -> bool {
        matches!(self.lock().get(key), Some(Slot::Loading(_)))
    }

    /// Drop the entry for `key`. An in-flight load still answers its
    /// waiters but its result is not cached.
    pub fn invalidate(&self, key: &MonthCacheKey) {
        self.lock().remove(key);
    }

    pub fn invalidate_user(&self, user_id: &str) {
        self.lock().retain(|key, _| key.user_id != user_id);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Return the cached value for `key`, or run `load` exactly once across
    /// all concurrent callers and share its outcome.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: MonthCacheKey,
        load: F,
    ) -> SyncResult<Vec<CalendarEvent>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Vec<CalendarEvent>>>,
    {
        let role = {
            let mut slots = self.lock();
            match slots.get(&key) {
                Some(Slot::Ready { events, stored_at }) if stored_at.elapsed() < self.ttl => {
                    Role::Cached(events.to_vec())
                }
                Some(Slot::Loading(rx)) => Role::Wait(rx.clone()),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    slots.insert(key.clone(), Slot::Loading(rx.clone()));
                    Role::Load(tx, rx)
                }
            }
        };

        match role {
            Role::Cached(events) => Ok(events),
            Role::Wait(mut rx) => {
                debug!(user_id = %key.user_id, month = %key.month, "joining in-flight month load");
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|outcome| outcome.clone())
                    .map_err(|_| SyncError::Backend("month load was abandoned".into()))?;
                match outcome {
                    Some(Ok(events)) => Ok(events.to_vec()),
                    Some(Err(message)) => Err(SyncError::Backend(message)),
                    None => Err(SyncError::Backend("month load was abandoned".into())),
                }
            }
            Role::Load(tx, rx) => {
                let mut sentinel = Sentinel {
                    cache: self,
                    key,
                    rx,
                    armed: true,
                };
                let result = load().await;
                sentinel.complete(&result);

                let outcome = match &result {
                    Ok(events) => Ok(Arc::new(events.clone())),
                    Err(e) => Err(e.to_string()),
                };
                tx.send_replace(Some(outcome));
                result
            }
        }
    }
}

/// Removes the `Loading` slot if the loader never completes.
struct Sentinel<'a> {
    cache: &'a MonthCache,
    key: MonthCacheKey,
    rx: watch::Receiver<LoadOutcome>,
    armed: bool,
}

impl Sentinel<'_> {
    fn still_ours(&self, slots: &HashMap<MonthCacheKey, Slot>) -> bool {
        matches!(slots.get(&self.key), Some(Slot::Loading(rx)) if rx.same_channel(&self.rx))
    }

    fn complete(&mut self, result: &SyncResult<Vec<CalendarEvent>>) {
        self.armed = false;
        let mut slots = self.cache.lock();
        if !self.still_ours(&slots) {
            return;
        }
        match result {
            Ok(events) => {
                slots.insert(
                    self.key.clone(),
                    Slot::Ready {
                        events: Arc::new(events.clone()),
                        stored_at: Instant::now(),
                    },
                );
            }
            Err(_) => {
                slots.remove(&self.key);
            }
        }
    }
}

impl Drop for Sentinel<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.cache.lock();
        if self.still_ours(&slots) {
            slots.remove(&self.key);
        }
    }
}
