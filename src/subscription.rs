//! Live query ownership for the signed-in user.
//!
//! A registry keyed by `events:<user>` tracks the one pair of live queries
//! (group events and personal events) the engine holds, plus how many
//! handles share it. Each live query is drained by its own task, which
//! merges snapshots into the store; tearing a subscription down aborts
//! those tasks, which drops the queries and cancels the listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use groupcal_core::{
    CalendarEvent, EventBackend, EventOrigin, EventQuery, KeyValueStorage, LiveQuery,
    QueryUpdate, RawDocument, SyncResult,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::colors::GroupColorResolver;
use crate::month_cache::MonthCache;
use crate::store::EventStore;

pub fn resource_key(user_id: &str) -> String {
    format!("events:{user_id}")
}

struct RegistryEntry {
    user_id: String,
    generation: u64,
    ref_count: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl RegistryEntry {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, RegistryEntry>,
    next_generation: u64,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SubscriptionManager<B, S> {
    backend: Arc<B>,
    store: EventStore,
    colors: Arc<GroupColorResolver>,
    cache: Arc<CacheManager<S>>,
    month_cache: Arc<MonthCache>,
    registry: Arc<Mutex<Registry>>,
}

impl<B: EventBackend, S: KeyValueStorage> SubscriptionManager<B, S> {
    pub fn new(
        backend: Arc<B>,
        store: EventStore,
        colors: Arc<GroupColorResolver>,
        cache: Arc<CacheManager<S>>,
        month_cache: Arc<MonthCache>,
    ) -> Self {
        SubscriptionManager {
            backend,
            store,
            colors,
            cache,
            month_cache,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Subscribe to `user_id`'s events.
    ///
    /// A second call for the same user shares the existing live queries and
    /// only bumps the reference count, unless `force_refresh` asks for them
    /// to be reopened. Subscribing a different user tears the previous
    /// user's queries down and clears the in-memory state first.
    pub async fn subscribe(
        &self,
        user_id: &str,
        force_refresh: bool,
    ) -> SyncResult<SubscriptionHandle> {
        let key = resource_key(user_id);

        let switching_user = {
            let mut registry = lock(&self.registry);
            if let Some(entry) = registry.entries.get_mut(&key)
                && !force_refresh
            {
                entry.ref_count += 1;
                debug!(%key, refs = entry.ref_count, "sharing existing subscription");
                return Ok(self.handle(key, entry.generation));
            }

            let others: Vec<String> = registry
                .entries
                .keys()
                .filter(|k| **k != key)
                .cloned()
                .collect();
            for other in &others {
                if let Some(entry) = registry.entries.remove(other) {
                    info!(
                        previous_user = %entry.user_id,
                        "tearing down previous user's subscription"
                    );
                    entry.abort();
                }
            }
            !others.is_empty()
        };

        if switching_user {
            self.store.clear();
            self.colors.clear();
            self.month_cache.clear();
        }

        if let Err(e) = self.cache.cleanup(user_id).await {
            warn!(user_id, error = %e, "cache cleanup failed");
        }
        if self.store.is_empty() {
            self.hydrate_from_cache(user_id).await;
        }

        let memberships = self.backend.memberships(user_id).await?;
        self.colors.load_memberships(user_id, &memberships);
        let colors = self.colors.clone();
        self.store.apply(|events| {
            for event in events.iter_mut() {
                colors.apply_to(event);
            }
        });

        let group_ids: Vec<String> = memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.group_id.clone())
            .collect();

        let mut tasks = vec![];
        let personal = self.backend.listen(EventQuery::PersonalEvents {
            user_id: user_id.to_string(),
        })?;
        tasks.push(self.spawn_listener(user_id, personal, EventOrigin::Personal));

        if group_ids.is_empty() {
            // No group query to replace them, so drop stale group events now
            self.store.merge_stream(EventOrigin::Group, vec![], |_| {});
        } else {
            let groups = match self.backend.listen(EventQuery::GroupEvents { group_ids }) {
                Ok(live) => live,
                Err(e) => {
                    for task in &tasks {
                        task.abort();
                    }
                    return Err(e);
                }
            };
            tasks.push(self.spawn_listener(user_id, groups, EventOrigin::Group));
        }

        let mut registry = lock(&self.registry);
        let generation = match registry.entries.get_mut(&key) {
            Some(entry) => {
                entry.abort();
                entry.tasks = tasks;
                entry.ref_count += 1;
                entry.generation
            }
            None => {
                registry.next_generation += 1;
                let generation = registry.next_generation;
                registry.entries.insert(
                    key.clone(),
                    RegistryEntry {
                        user_id: user_id.to_string(),
                        generation,
                        ref_count: 1,
                        tasks,
                    },
                );
                generation
            }
        };
        info!(%key, force_refresh, "subscribed to live event queries");
        Ok(self.handle(key, generation))
    }

    fn handle(&self, key: String, generation: u64) -> SubscriptionHandle {
        SubscriptionHandle {
            registry: Arc::downgrade(&self.registry),
            key,
            generation,
            released: AtomicBool::new(false),
        }
    }

    async fn hydrate_from_cache(&self, user_id: &str) {
        match self.cache.load(user_id).await {
            Ok(cached) if !cached.is_empty() => {
                debug!(user_id, events = cached.len(), "hydrated store from offline cache");
                self.store.apply(|events| events.extend(cached));
            }
            Ok(_) => {}
            Err(e) => warn!(user_id, error = %e, "could not read offline cache"),
        }
    }

    fn spawn_listener(
        &self,
        user_id: &str,
        mut live: LiveQuery,
        origin: EventOrigin,
    ) -> JoinHandle<()> {
        let user_id = user_id.to_string();
        let store = self.store.clone();
        let colors = self.colors.clone();
        let cache = self.cache.clone();
        let month_cache = self.month_cache.clone();

        tokio::spawn(async move {
            while let Some(update) = live.next().await {
                match update {
                    QueryUpdate::Snapshot(docs) => {
                        let events = decode_snapshot(&docs, origin);
                        debug!(%user_id, ?origin, events = events.len(), "applying snapshot");
                        store.merge_stream(origin, events, |event| colors.apply_to(event));
                        month_cache.invalidate_user(&user_id);

                        if let Err(e) = cache.save(&user_id, &store.events()).await {
                            warn!(
                                %user_id,
                                error = %e,
                                "could not persist snapshot to offline cache"
                            );
                        }
                    }
                    QueryUpdate::Error(message) => {
                        warn!(
                            %user_id,
                            ?origin,
                            %message,
                            "live query error; keeping last known events"
                        );
                    }
                }
            }
            debug!(%user_id, ?origin, "live query closed");
        })
    }

    /// Force-close every subscription regardless of outstanding handles.
    pub fn teardown_all(&self) {
        let mut registry = lock(&self.registry);
        for (key, entry) in registry.entries.drain() {
            debug!(%key, "tearing down subscription");
            entry.abort();
        }
    }

    pub fn active_user(&self) -> Option<String> {
        lock(&self.registry)
            .entries
            .values()
            .next()
            .map(|entry| entry.user_id.clone())
    }

    /// Number of handles sharing `user_id`'s subscription (0 if none).
    pub fn ref_count(&self, user_id: &str) -> usize {
        lock(&self.registry)
            .entries
            .get(&resource_key(user_id))
            .map_or(0, |entry| entry.ref_count)
    }

    pub fn is_subscribed(&self, user_id: &str) -> bool {
        self.ref_count(user_id) > 0
    }
}

impl<B, S> Drop for SubscriptionManager<B, S> {
    fn drop(&mut self) {
        for entry in lock(&self.registry).entries.values() {
            entry.abort();
        }
    }
}

/// Decode a snapshot, skipping malformed documents.
fn decode_snapshot(docs: &[RawDocument], origin: EventOrigin) -> Vec<CalendarEvent> {
    docs.iter()
        .filter_map(|doc| match doc.decode(origin) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "skipping malformed event document");
                None
            }
        })
        .collect()
}

/// One share of a subscription. Dropping it does nothing; call `teardown`.
pub struct SubscriptionHandle {
    registry: Weak<Mutex<Registry>>,
    key: String,
    generation: u64,
    released: AtomicBool,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release this share. The last release closes both live queries.
    /// Safe to call any number of times, including after the subscription
    /// was replaced or force-closed.
    pub fn teardown(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let mut registry = lock(&registry);
        let Some(entry) = registry.entries.get_mut(&self.key) else {
            return;
        };
        if entry.generation != self.generation {
            return;
        }

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0
            && let Some(entry) = registry.entries.remove(&self.key)
        {
            debug!(key = %self.key, "last handle released; closing live queries");
            entry.abort();
        }
    }
}
