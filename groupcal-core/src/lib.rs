//! Core types for the groupcal sync engine.
//!
//! This crate provides the shared vocabulary used by `groupcal-sync` and by
//! host applications that plug a backend into it:
//! - `CalendarEvent` and the draft/patch types used to mutate events
//! - `RawDocument`, the untyped shape crossing the backend boundary, and its decoder
//! - `MonthKey` for month-bucketed caching
//! - `capability` traits for the realtime store, key-value storage,
//!   connectivity and auth collaborators
//! - `EngineConfig` and the `SyncError` taxonomy

pub mod capability;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod month;

pub use capability::*;
pub use config::EngineConfig;
pub use document::{RawDocument, event_fields, patch_fields};
pub use error::{SyncError, SyncResult};
pub use event::*;
pub use month::MonthKey;
