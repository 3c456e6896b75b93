//! Client-side calendar sync engine.
//!
//! `groupcal-sync` keeps a signed-in user's group and personal calendar
//! events in one in-memory store fed by two live backend queries. Writes
//! are optimistic, a per-month cache coalesces concurrent reads, and
//! mutations made while offline are queued durably and replayed on
//! reconnect.
//!
//! Start a [`SyncEngine`] with a backend, a key-value storage, a
//! connectivity signal and an auth provider:
//!
//! ```no_run
//! use std::sync::Arc;
//! use groupcal_sync::{
//!     Connectivity, EngineConfig, EventDraft, ManualConnectivity, MemoryBackend, MemoryStorage,
//!     StaticAuth, SyncEngine,
//! };
//!
//! # async fn demo() -> groupcal_sync::SyncResult<()> {
//! let engine = SyncEngine::start(
//!     EngineConfig::default(),
//!     Arc::new(MemoryBackend::new()),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(ManualConnectivity::new(Connectivity::Online)),
//!     Arc::new(StaticAuth::signed_in("alice")),
//! );
//! let handle = engine.subscribe("alice", false).await?;
//! let _updates = engine.register_callback(|events| println!("{} events", events.len()));
//! let start = chrono::NaiveDate::from_ymd_opt(2025, 4, 1).unwrap();
//! engine.add(EventDraft::new("Dentist", start)).await?;
//! handle.teardown();
//! engine.dispose();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod colors;
pub mod connectivity;
pub mod coordinator;
pub mod engine;
pub mod memory;
pub mod month_cache;
pub mod offline_queue;
pub mod storage;
pub mod store;
pub mod subscription;

pub use groupcal_core::*;

pub use cache::CacheManager;
pub use colors::GroupColorResolver;
pub use coordinator::{AddOutcome, DuplicateGuard, MutationCoordinator};
pub use engine::SyncEngine;
pub use memory::MemoryBackend;
pub use month_cache::{MonthCache, MonthCacheKey};
pub use offline_queue::{FlushReport, OfflineQueue, QueueEntry, QueuedMutation};
pub use storage::{FileStorage, MemoryStorage};
pub use store::{CallbackRegistration, EventStore};
pub use subscription::{SubscriptionHandle, SubscriptionManager};
