//! The canonical in-memory event list and its change listeners.
//!
//! Every write goes through `EventStore::apply`: the mutator runs to
//! completion under the store lock, the id-uniqueness invariant is
//! re-established, and registered callbacks then receive an immutable
//! snapshot. Snapshots are delivered in version order, one delivery at a
//! time and never under a lock, so a callback may write to the store; its
//! own update is delivered once the current round of callbacks returns.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use groupcal_core::{CalendarEvent, EventOrigin, EventPatch, MonthKey};
use tracing::trace;

pub type EventCallback = dyn Fn(&[CalendarEvent]) + Send + Sync;

/// An offline change waiting in the queue, re-applied to every stream
/// payload until the backend has seen it.
#[derive(Debug, Clone, PartialEq)]
pub enum HeldChange {
    Patch(EventPatch),
    Delete,
}

struct Held {
    entry_id: String,
    event_id: String,
    change: HeldChange,
}

#[derive(Default)]
struct State {
    events: Vec<CalendarEvent>,
    version: u64,
    callbacks: BTreeMap<u64, Arc<EventCallback>>,
    next_callback_id: u64,
    held: Vec<Held>,
}

struct Notification {
    version: u64,
    snapshot: Vec<CalendarEvent>,
    callbacks: Vec<Arc<EventCallback>>,
}

#[derive(Default)]
struct Delivery {
    /// Version of the last snapshot handed to callbacks
    delivered: u64,
    next: Option<Notification>,
    running: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    delivery: Mutex<Delivery>,
}

/// Shared handle to the canonical event list. Clones refer to the same store.
#[derive(Clone, Default)]
pub struct EventStore {
    shared: Arc<Shared>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_delivery(&self) -> MutexGuard<'_, Delivery> {
        self.shared
            .delivery
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `mutator` against the event list and notify callbacks.
    pub fn apply<R>(&self, mutator: impl FnOnce(&mut Vec<CalendarEvent>) -> R) -> R {
        self.apply_state(|state| mutator(&mut state.events))
    }

    fn apply_state<R>(&self, mutator: impl FnOnce(&mut State) -> R) -> R {
        let (result, notification) = {
            let mut state = self.lock();
            let result = mutator(&mut state);
            let events = std::mem::take(&mut state.events);
            state.events = dedup_last_wins(events);
            state.version += 1;
            let notification = Notification {
                version: state.version,
                snapshot: state.events.clone(),
                callbacks: state.callbacks.values().cloned().collect(),
            };
            (result, notification)
        };

        self.deliver(notification);
        result
    }

    /// Hand `notification` to callbacks, or to the caller already
    /// delivering. Only the newest pending snapshot is kept.
    fn deliver(&self, notification: Notification) {
        {
            let mut delivery = self.lock_delivery();
            let superseded = notification.version <= delivery.delivered
                || delivery
                    .next
                    .as_ref()
                    .is_some_and(|next| next.version >= notification.version);
            if superseded {
                return;
            }
            delivery.next = Some(notification);
            if delivery.running {
                return;
            }
            delivery.running = true;
        }

        loop {
            let next = {
                let mut delivery = self.lock_delivery();
                match delivery.next.take() {
                    Some(next) => {
                        delivery.delivered = next.version;
                        next
                    }
                    None => {
                        delivery.running = false;
                        return;
                    }
                }
            };

            trace!(
                version = next.version,
                events = next.snapshot.len(),
                "notifying event callbacks"
            );
            for callback in &next.callbacks {
                callback(&next.snapshot);
            }
        }
    }

    /// Replace the events delivered by one stream with `fresh`.
    ///
    /// Events from the other stream and local optimistic events are kept,
    /// the fresh payload is appended, and duplicates collapse by id with the
    /// fresh copy winning. Held offline changes are re-applied to the fresh
    /// copies before `decorate` runs on each of them. A local placeholder
    /// whose id a fresh event names as its `client_ref` is retired, so a
    /// confirmed create never shows twice while its own write is still
    /// resolving.
    pub fn merge_stream(
        &self,
        origin: EventOrigin,
        mut fresh: Vec<CalendarEvent>,
        decorate: impl Fn(&mut CalendarEvent),
    ) {
        let confirmed: HashSet<String> =
            fresh.iter().filter_map(|e| e.client_ref.clone()).collect();

        self.apply_state(|state| {
            let held = &state.held;
            fresh.retain_mut(|event| {
                let event_id = event.id.clone();
                for pending in held.iter().filter(|h| h.event_id == event_id) {
                    match &pending.change {
                        HeldChange::Delete => return false,
                        HeldChange::Patch(patch) => event.apply_patch(patch),
                    }
                }
                decorate(event);
                true
            });

            state.events.retain(|e| {
                e.origin != origin && !(e.origin == EventOrigin::Local && confirmed.contains(&e.id))
            });
            state.events.extend(fresh);
        });
    }

    /// Keep `change` applied to `event_id` across stream merges until the
    /// queue entry `entry_id` is released. Holding an entry twice is a no-op.
    pub fn hold(&self, entry_id: &str, event_id: &str, change: HeldChange) {
        let mut state = self.lock();
        if state.held.iter().any(|h| h.entry_id == entry_id) {
            return;
        }
        state.held.push(Held {
            entry_id: entry_id.to_string(),
            event_id: event_id.to_string(),
            change,
        });
    }

    pub fn release(&self, entry_id: &str) {
        self.lock().held.retain(|h| h.entry_id != entry_id);
    }

    pub fn clear_held(&self) {
        self.lock().held.clear();
    }

    pub fn held_count(&self) -> usize {
        self.lock().held.len()
    }

    /// Insert or replace the event with the same id.
    pub fn upsert(&self, event: CalendarEvent) {
        self.apply(|events| match events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event,
            None => events.push(event),
        });
    }

    /// Remove an event, returning it if it was present.
    pub fn remove(&self, id: &str) -> Option<CalendarEvent> {
        self.apply(|events| {
            let index = events.iter().position(|e| e.id == id)?;
            Some(events.remove(index))
        })
    }

    /// Swap the record stored under `old_id` for `event` in a single step.
    ///
    /// If a record with the new id already arrived from a stream, the
    /// placeholder is dropped and that record is replaced. When neither is
    /// present any more the event was removed meanwhile: nothing is stored
    /// and false is returned.
    pub fn replace(&self, old_id: &str, event: CalendarEvent) -> bool {
        self.apply(|events| {
            let placeholder = events.iter().position(|e| e.id == old_id);
            let existing = events.iter().position(|e| e.id == event.id);
            match (placeholder, existing) {
                (_, Some(index)) => {
                    events[index] = event;
                    events.retain(|e| e.id != old_id);
                    true
                }
                (Some(index), None) => {
                    events[index] = event;
                    true
                }
                (None, None) => false,
            }
        })
    }

    pub fn clear(&self) {
        self.apply(|events| events.clear());
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        self.lock().events.clone()
    }

    pub fn get(&self, id: &str) -> Option<CalendarEvent> {
        self.lock().events.iter().find(|e| e.id == id).cloned()
    }

    /// The record created from the offline placeholder `offline_id`, under
    /// whichever id it currently has.
    pub fn find_offline_created(&self, offline_id: &str) -> Option<CalendarEvent> {
        self.lock()
            .events
            .iter()
            .find(|e| e.id == offline_id || e.offline_id.as_deref() == Some(offline_id))
            .cloned()
    }

    pub fn events_in_month(&self, month: MonthKey) -> Vec<CalendarEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.overlaps_month(month))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    pub fn callback_count(&self) -> usize {
        self.lock().callbacks.len()
    }

    /// Add a change listener. If the store already holds events the
    /// callback is invoked once right away with the current state.
    pub fn register_callback<F>(&self, callback: F) -> CallbackRegistration
    where
        F: Fn(&[CalendarEvent]) + Send + Sync + 'static,
    {
        let callback: Arc<EventCallback> = Arc::new(callback);
        let (id, current) = {
            let mut state = self.lock();
            let id = state.next_callback_id;
            state.next_callback_id += 1;
            state.callbacks.insert(id, callback.clone());
            (id, state.events.clone())
        };

        if !current.is_empty() {
            callback(&current);
        }

        CallbackRegistration {
            store: Arc::downgrade(&self.shared),
            id,
            released: AtomicBool::new(false),
        }
    }
}

/// Handle returned by `register_callback`.
pub struct CallbackRegistration {
    store: Weak<Shared>,
    id: u64,
    released: AtomicBool,
}

impl CallbackRegistration {
    /// Stop receiving updates. Safe to call more than once.
    pub fn unregister(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.store.upgrade() {
            let mut state = shared
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state.callbacks.remove(&self.id);
        }
    }
}

/// Collapse duplicate ids: the last copy wins, at the first copy's position.
fn dedup_last_wins(events: Vec<CalendarEvent>) -> Vec<CalendarEvent> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(events.len());
    let mut deduped: Vec<CalendarEvent> = Vec::with_capacity(events.len());

    for event in events {
        match positions.get(&event.id) {
            Some(&index) => deduped[index] = event,
            None => {
                positions.insert(event.id.clone(), deduped.len());
                deduped.push(event);
            }
        }
    }

    deduped
}
