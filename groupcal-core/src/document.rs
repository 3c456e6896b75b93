//! Decode/validate boundary between backend documents and `CalendarEvent`.
//!
//! Documents arrive from the realtime store as loosely typed JSON maps.
//! `RawDocument::decode` is the only way they become events: required
//! fields are checked, dates are parsed and normalized, and unknown fields
//! are dropped rather than spread into application state.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};
use crate::event::{CalendarEvent, EventOrigin, EventPatch, PERSONAL_GROUP};

/// An untyped document as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// Wire shape of an event document (camelCase, as stored remotely).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEvent {
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    time: Option<String>,
    #[serde(alias = "ownerUserId")]
    user_id: Option<String>,
    #[serde(default)]
    group_id: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    notification_minutes_before: Option<i64>,
    #[serde(default)]
    notification_id: Option<String>,
    #[serde(default)]
    is_offline_created: Option<bool>,
    #[serde(default)]
    offline_id: Option<String>,
    #[serde(default)]
    is_shared_event: Option<bool>,
    #[serde(default)]
    client_ref: Option<String>,
    /// Written for readers that expect it, never trusted on decode
    #[serde(default)]
    is_multi_day: Option<bool>,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        RawDocument {
            id: id.into(),
            fields,
        }
    }

    /// Convert into a typed event tagged with `origin`.
    pub fn decode(&self, origin: EventOrigin) -> SyncResult<CalendarEvent> {
        let reject = |reason: &str| SyncError::Decode {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        let stored: StoredEvent = serde_json::from_value(Value::Object(self.fields.clone()))
            .map_err(|e| reject(&e.to_string()))?;

        let title = stored
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| reject("missing title"))?;
        let owner_user_id = stored.user_id.ok_or_else(|| reject("missing userId"))?;
        let start_date = stored
            .start_date
            .as_deref()
            .and_then(parse_date)
            .ok_or_else(|| reject("missing or invalid startDate"))?;
        let end_date = match stored.end_date.as_deref() {
            Some(s) => parse_date(s).ok_or_else(|| reject("invalid endDate"))?,
            None => start_date,
        };
        let time = match stored.time.as_deref() {
            Some("") | None => None,
            Some(s) => Some(parse_time(s).ok_or_else(|| reject("invalid time"))?),
        };

        let group_id = stored
            .group_id
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| PERSONAL_GROUP.to_string());
        let created_at = stored.created_at.unwrap_or_else(Utc::now);

        let mut event = CalendarEvent {
            id: self.id.clone(),
            title,
            description: stored.description,
            start_date,
            end_date,
            is_multi_day: false,
            time,
            owner_user_id,
            is_shared_event: stored
                .is_shared_event
                .unwrap_or(group_id != PERSONAL_GROUP),
            group_id,
            color: String::new(),
            stored_color: stored.color,
            created_at,
            updated_at: stored.updated_at.unwrap_or(created_at),
            notification_minutes_before: stored.notification_minutes_before,
            notification_id: stored.notification_id,
            is_offline_created: stored.is_offline_created.unwrap_or(false),
            offline_id: stored.offline_id,
            client_ref: stored.client_ref,
            origin,
        };
        event.normalize();
        Ok(event)
    }
}

/// Backend fields for `event`, as written by create and update calls.
pub fn event_fields(event: &CalendarEvent) -> SyncResult<Map<String, Value>> {
    let stored = StoredEvent {
        title: Some(event.title.clone()),
        description: event.description.clone(),
        start_date: Some(event.start_date.format("%Y-%m-%d").to_string()),
        end_date: Some(event.end_date.format("%Y-%m-%d").to_string()),
        time: event.time.map(|t| t.format("%H:%M").to_string()),
        user_id: Some(event.owner_user_id.clone()),
        group_id: Some(event.group_id.clone()),
        color: event.stored_color.clone(),
        created_at: Some(event.created_at),
        updated_at: Some(event.updated_at),
        notification_minutes_before: event.notification_minutes_before,
        notification_id: event.notification_id.clone(),
        is_offline_created: Some(event.is_offline_created),
        offline_id: event.offline_id.clone(),
        is_shared_event: Some(event.is_shared_event),
        client_ref: event.client_ref.clone(),
        is_multi_day: Some(event.start_date != event.end_date),
    };

    match serde_json::to_value(stored)? {
        Value::Object(mut map) => {
            map.retain(|_, v| !v.is_null());
            Ok(map)
        }
        _ => Err(SyncError::Serialization(
            "event did not serialize to an object".into(),
        )),
    }
}

/// Backend fields touched by `patch`, plus a fresh `updatedAt`.
///
/// Only the patched fields are sent so concurrent edits to other fields
/// survive. Readers re-normalize the date range on decode.
pub fn patch_fields(patch: &EventPatch) -> Map<String, Value> {
    let mut fields = Map::new();
    let mut put = |name: &str, value: Value| {
        fields.insert(name.to_string(), value);
    };

    if let Some(title) = &patch.title {
        put("title", Value::from(title.as_str()));
    }
    if let Some(description) = &patch.description {
        put("description", Value::from(description.as_str()));
    }
    if let Some(start_date) = patch.start_date {
        put("startDate", Value::from(start_date.format("%Y-%m-%d").to_string()));
    }
    if let Some(end_date) = patch.end_date {
        put("endDate", Value::from(end_date.format("%Y-%m-%d").to_string()));
    }
    if let Some(time) = patch.time {
        put("time", Value::from(time.format("%H:%M").to_string()));
    }
    if let Some(group_id) = &patch.group_id {
        put("groupId", Value::from(group_id.as_str()));
        put("isSharedEvent", Value::from(group_id != PERSONAL_GROUP));
    }
    if let Some(color) = &patch.color {
        put("color", Value::from(color.as_str()));
    }
    if let Some(minutes) = patch.notification_minutes_before {
        put("notificationMinutesBefore", Value::from(minutes));
    }
    put("updatedAt", Value::from(Utc::now().to_rfc3339()));
    fields
}

/// Accepts `YYYY-MM-DD` and full RFC 3339 timestamps.
fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}
