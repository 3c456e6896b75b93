//! The sync engine service object.
//!
//! `SyncEngine` owns one session's worth of state: the event store, color
//! map, caches, offline queue, live subscriptions and the connectivity
//! watcher. Nothing is global; create one with `start` and shut it down
//! with `dispose`.

use std::sync::{Arc, Mutex};

use groupcal_core::{
    AuthProvider, CalendarEvent, ConnectivityObserver, EngineConfig, EventBackend, EventDraft,
    EventOrigin, EventPatch, KeyValueStorage, MonthKey, SyncError, SyncResult,
};
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::colors::GroupColorResolver;
use crate::connectivity::ConnectivityWatcher;
use crate::coordinator::{AddOutcome, MutationCoordinator};
use crate::month_cache::{MonthCache, MonthCacheKey};
use crate::offline_queue::{FlushReport, OfflineQueue, QueueEntry};
use crate::storage::FileStorage;
use crate::store::{CallbackRegistration, EventStore};
use crate::subscription::{SubscriptionHandle, SubscriptionManager};

pub struct SyncEngine<B, S> {
    config: EngineConfig,
    backend: Arc<B>,
    store: EventStore,
    colors: Arc<GroupColorResolver>,
    cache: Arc<CacheManager<S>>,
    month_cache: Arc<MonthCache>,
    queue: Arc<OfflineQueue<S>>,
    subscriptions: SubscriptionManager<B, S>,
    coordinator: Arc<MutationCoordinator<B, S>>,
    connectivity: Arc<dyn ConnectivityObserver>,
    watcher: Mutex<Option<ConnectivityWatcher>>,
}

impl<B: EventBackend> SyncEngine<B, FileStorage> {
    /// Start an engine persisting to `config.storage_path()`.
    pub fn start_with_file_storage(
        config: EngineConfig,
        backend: Arc<B>,
        connectivity: Arc<dyn ConnectivityObserver>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let storage = Arc::new(FileStorage::new(config.storage_path()));
        Self::start(config, backend, storage, connectivity, auth)
    }
}

impl<B: EventBackend, S: KeyValueStorage> SyncEngine<B, S> {
    /// Wire the components together and start watching connectivity.
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: EngineConfig,
        backend: Arc<B>,
        storage: Arc<S>,
        connectivity: Arc<dyn ConnectivityObserver>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let store = EventStore::new();
        let colors = Arc::new(GroupColorResolver::new(
            config.personal_color.clone(),
            config.default_group_color.clone(),
        ));
        let cache = Arc::new(CacheManager::new(storage.clone(), config.retention_months));
        let month_cache = Arc::new(MonthCache::new(config.month_cache_ttl));
        let queue = Arc::new(OfflineQueue::new(storage));

        let subscriptions = SubscriptionManager::new(
            backend.clone(),
            store.clone(),
            colors.clone(),
            cache.clone(),
            month_cache.clone(),
        );
        let coordinator = Arc::new(MutationCoordinator::new(
            backend.clone(),
            store.clone(),
            queue.clone(),
            month_cache.clone(),
            colors.clone(),
            connectivity.clone(),
            auth,
            config.duplicate_window,
        ));
        let watcher = ConnectivityWatcher::spawn(connectivity.as_ref(), coordinator.clone());

        info!(
            ttl = ?config.month_cache_ttl,
            retention_months = config.retention_months,
            "sync engine started"
        );

        SyncEngine {
            config,
            backend,
            store,
            colors,
            cache,
            month_cache,
            queue,
            subscriptions,
            coordinator,
            connectivity,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Subscribe to `user_id`'s live events. Offline changes still queued
    /// from an earlier session are held first so snapshots cannot undo them.
    pub async fn subscribe(
        &self,
        user_id: &str,
        force_refresh: bool,
    ) -> SyncResult<SubscriptionHandle> {
        let held = self.coordinator.restore_held().await?;
        if held > 0 {
            debug!(held, "holding queued offline changes over live snapshots");
        }
        self.subscriptions.subscribe(user_id, force_refresh).await
    }

    pub fn register_callback<F>(&self, callback: F) -> CallbackRegistration
    where
        F: Fn(&[CalendarEvent]) + Send + Sync + 'static,
    {
        self.store.register_callback(callback)
    }

    pub async fn add(&self, draft: EventDraft) -> SyncResult<AddOutcome> {
        self.coordinator.add(draft).await
    }

    pub async fn update(&self, id: &str, patch: EventPatch) -> SyncResult<()> {
        self.coordinator.update(id, patch).await
    }

    pub async fn remove(&self, id: &str) -> SyncResult<()> {
        self.coordinator.remove(id).await
    }

    /// Events of `user_id` overlapping the given month.
    ///
    /// Served from the month cache when fresh. Otherwise one backend fetch is
    /// shared by every concurrent caller; if it fails, the persisted cache
    /// is read instead, overlaid with what the store holds for that month.
    pub async fn get_events_for_month(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> SyncResult<Vec<CalendarEvent>> {
        let month = MonthKey::new(year, month).ok_or(SyncError::InvalidMonth { year, month })?;
        let key = MonthCacheKey::new(user_id, month);

        let fetched = self
            .month_cache
            .get_or_load(key, || self.fetch_month(user_id, month))
            .await;

        match fetched {
            Ok(events) => Ok(events),
            Err(e) => {
                warn!(user_id, %month, error = %e, "month fetch failed; using offline cache");
                let local = if self.active_user().as_deref() == Some(user_id) {
                    self.store.events_in_month(month)
                } else {
                    vec![]
                };
                let mut events: Vec<CalendarEvent> = self
                    .cache
                    .load_month(user_id, month)
                    .await?
                    .into_iter()
                    .filter(|cached| !local.iter().any(|e| e.id == cached.id))
                    .collect();
                for event in &mut events {
                    self.colors.apply_to(event);
                }
                events.extend(local);
                Ok(events)
            }
        }
    }

    async fn fetch_month(&self, user_id: &str, month: MonthKey) -> SyncResult<Vec<CalendarEvent>> {
        let docs = self.backend.fetch_month(user_id, month).await?;
        let events: Vec<CalendarEvent> = docs
            .iter()
            .filter_map(|doc| match doc.decode(EventOrigin::Local) {
                Ok(mut event) => {
                    event.origin = EventOrigin::for_group(&event.group_id);
                    self.colors.apply_to(&mut event);
                    Some(event)
                }
                Err(e) => {
                    warn!(error = %e, "skipping malformed event document");
                    None
                }
            })
            .collect();
        debug!(user_id, %month, events = events.len(), "fetched month");
        Ok(events)
    }

    /// Recolor a group's loaded events without refetching anything.
    pub fn update_group_color(&self, group_id: &str, color: &str) {
        self.colors.update_color(&self.store, group_id, color);
        // Cached month lists carry resolved colors
        self.month_cache.clear();
    }

    /// Forget everything held for the current session (logout).
    pub async fn clear_all_cache_and_state(&self) -> SyncResult<()> {
        self.subscriptions.teardown_all();
        self.store.clear();
        self.store.clear_held();
        self.colors.clear();
        self.month_cache.clear();
        self.cache.clear_all().await?;
        self.queue.clear().await?;
        info!("cleared all cached events and session state");
        Ok(())
    }

    /// Replay queued offline mutations now, if online.
    pub async fn flush_offline_queue(&self) -> SyncResult<FlushReport> {
        self.coordinator.flush().await
    }

    pub async fn pending_mutations(&self) -> SyncResult<Vec<QueueEntry>> {
        self.queue.entries().await
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.store.events()
    }

    pub fn active_user(&self) -> Option<String> {
        self.subscriptions.active_user()
    }

    /// Number of handles sharing `user_id`'s live subscription.
    pub fn subscription_refs(&self, user_id: &str) -> usize {
        self.subscriptions.ref_count(user_id)
    }

    /// Stop background work and close every live query. The store keeps its
    /// contents until the engine is dropped.
    pub fn dispose(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        self.subscriptions.teardown_all();
        debug!("sync engine disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.watcher
            .lock()
            .map(|watcher| watcher.is_none())
            .unwrap_or(true)
    }
}
