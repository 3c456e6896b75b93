//! Calendar event model.
//!
//! `CalendarEvent` is the typed record held by the event store, the month
//! caches and the offline queue. Raw backend documents are converted into it
//! through `crate::document`; nothing else builds events from untyped data.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::month::MonthKey;

/// Sentinel group id for private events.
pub const PERSONAL_GROUP: &str = "personal";

pub const TEMP_ID_PREFIX: &str = "temp_";
pub const OFFLINE_ID_PREFIX: &str = "offline_";

/// Which feed an event entered the store through.
///
/// Stream merges replace exactly the events carrying their own origin, so
/// the tag is set once at ingestion and never inferred from other fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Delivered by the group-events live query.
    Group,
    /// Delivered by the personal-events live query.
    Personal,
    /// Created locally and not yet seen on either stream.
    #[default]
    Local,
}

impl EventOrigin {
    /// The stream an event with this group id is delivered through.
    pub fn for_group(group_id: &str) -> Self {
        if group_id == PERSONAL_GROUP {
            EventOrigin::Personal
        } else {
            EventOrigin::Group
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIdKind {
    /// Assigned by the backend.
    Durable,
    /// Placeholder while an online write is in flight.
    Temporary,
    /// Placeholder while the create sits in the offline queue.
    Offline,
}

impl EventIdKind {
    pub fn of(id: &str) -> Self {
        if id.starts_with(TEMP_ID_PREFIX) {
            EventIdKind::Temporary
        } else if id.starts_with(OFFLINE_ID_PREFIX) {
            EventIdKind::Offline
        } else {
            EventIdKind::Durable
        }
    }
}

pub fn temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple())
}

pub fn offline_id() -> String {
    format!("{OFFLINE_ID_PREFIX}{}", Uuid::new_v4().simple())
}

/// A calendar event as held by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    /// First day of the event (inclusive)
    pub start_date: NaiveDate,
    /// Last day of the event (inclusive, never before `start_date`)
    pub end_date: NaiveDate,
    /// Derived from the date range by `normalize`
    pub is_multi_day: bool,
    pub time: Option<NaiveTime>,
    pub owner_user_id: String,
    /// Owning group, or `PERSONAL_GROUP`
    pub group_id: String,
    /// Display color resolved at merge time
    pub color: String,
    /// Color persisted on the document itself, used only as a fallback
    pub stored_color: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Notifications
    pub notification_minutes_before: Option<i64>,
    pub notification_id: Option<String>,

    // Provenance
    pub is_offline_created: bool,
    pub offline_id: Option<String>,
    pub is_shared_event: bool,
    /// Placeholder id this record was created under, echoed back by the
    /// backend so a snapshot can retire the local placeholder
    #[serde(default)]
    pub client_ref: Option<String>,

    #[serde(default)]
    pub origin: EventOrigin,
}

impl CalendarEvent {
    /// Re-establish the date invariants: an inverted range collapses onto
    /// the start date and `is_multi_day` is recomputed from the range.
    pub fn normalize(&mut self) {
        if self.end_date < self.start_date {
            self.end_date = self.start_date;
        }
        self.is_multi_day = self.start_date != self.end_date;
    }

    pub fn is_personal(&self) -> bool {
        self.group_id == PERSONAL_GROUP
    }

    pub fn id_kind(&self) -> EventIdKind {
        EventIdKind::of(&self.id)
    }

    /// Whether any day of the event falls inside `month`.
    pub fn overlaps_month(&self, month: MonthKey) -> bool {
        self.start_date <= month.last_day() && self.end_date >= month.first_day()
    }

    /// Every month the event touches, in order.
    pub fn months(&self) -> Vec<MonthKey> {
        let last = MonthKey::from_date(self.end_date);
        let mut months = vec![];
        let mut current = MonthKey::from_date(self.start_date);
        while current <= last {
            months.push(current);
            current = current.next();
        }
        months
    }

    /// Apply a partial update, bump `updated_at` and re-normalize.
    pub fn apply_patch(&mut self, patch: &EventPatch) {
        if let Some(title) = &patch.title {
            self.title = title.clone();
        }
        if let Some(description) = &patch.description {
            self.description = Some(description.clone());
        }
        if let Some(start_date) = patch.start_date {
            self.start_date = start_date;
        }
        if let Some(end_date) = patch.end_date {
            self.end_date = end_date;
        }
        if let Some(time) = patch.time {
            self.time = Some(time);
        }
        if let Some(group_id) = &patch.group_id {
            self.group_id = group_id.clone();
        }
        if let Some(color) = &patch.color {
            self.stored_color = Some(color.clone());
        }
        if let Some(minutes) = patch.notification_minutes_before {
            self.notification_minutes_before = Some(minutes);
        }
        self.updated_at = Utc::now();
        self.normalize();
    }
}

/// Caller-supplied fields for a new event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub title: String,
    pub description: Option<String>,
    pub start_date: NaiveDate,
    /// Defaults to `start_date`
    pub end_date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    /// Defaults to `PERSONAL_GROUP`
    pub group_id: Option<String>,
    pub color: Option<String>,
    pub notification_minutes_before: Option<i64>,
}

impl EventDraft {
    pub fn new(title: impl Into<String>, start_date: NaiveDate) -> Self {
        EventDraft {
            title: title.into(),
            description: None,
            start_date,
            end_date: None,
            time: None,
            group_id: None,
            color: None,
            notification_minutes_before: None,
        }
    }

    pub fn ending(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn at(mut self, time: NaiveTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn group_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(PERSONAL_GROUP)
    }

    /// Build a normalized event owned by `owner_user_id` under the given id.
    /// The display color is left empty for the color resolver to fill in.
    pub fn into_event(self, id: String, owner_user_id: &str) -> CalendarEvent {
        let now = Utc::now();
        let group_id = self.group_id().to_string();
        let mut event = CalendarEvent {
            id,
            title: self.title,
            description: self.description,
            start_date: self.start_date,
            end_date: self.end_date.unwrap_or(self.start_date),
            is_multi_day: false,
            time: self.time,
            owner_user_id: owner_user_id.to_string(),
            is_shared_event: group_id != PERSONAL_GROUP,
            group_id,
            color: String::new(),
            stored_color: self.color,
            created_at: now,
            updated_at: now,
            notification_minutes_before: self.notification_minutes_before,
            notification_id: None,
            is_offline_created: false,
            offline_id: None,
            client_ref: None,
            origin: EventOrigin::Local,
        };
        event.normalize();
        event
    }
}

/// A partial update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub group_id: Option<String>,
    pub color: Option<String>,
    pub notification_minutes_before: Option<i64>,
}

impl EventPatch {
    pub fn title(title: impl Into<String>) -> Self {
        EventPatch {
            title: Some(title.into()),
            ..Default::default()
        }
    }
}

/// The signed-in user's membership in one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembership {
    pub group_id: String,
    pub user_id: String,
    /// The color this member picked for the group
    pub color: Option<String>,
}
