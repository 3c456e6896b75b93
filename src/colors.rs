//! Group display colors.

use std::collections::HashMap;
use std::sync::RwLock;

use groupcal_core::{CalendarEvent, GroupMembership};
use tracing::debug;

use crate::store::EventStore;

/// groupId → color, built from the signed-in user's own memberships.
pub struct GroupColorResolver {
    colors: RwLock<HashMap<String, String>>,
    personal_color: String,
    default_group_color: String,
}

impl GroupColorResolver {
    pub fn new(personal_color: impl Into<String>, default_group_color: impl Into<String>) -> Self {
        GroupColorResolver {
            colors: RwLock::new(HashMap::new()),
            personal_color: personal_color.into(),
            default_group_color: default_group_color.into(),
        }
    }

    /// Rebuild the map from `user_id`'s membership records. Records for
    /// other members are ignored; each member picks their own group color.
    pub fn load_memberships(&self, user_id: &str, memberships: &[GroupMembership]) {
        let colors: HashMap<String, String> = memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| Some((m.group_id.clone(), m.color.clone()?)))
            .collect();

        debug!(user_id, groups = colors.len(), "loaded group colors");
        if let Ok(mut guard) = self.colors.write() {
            *guard = colors;
        }
    }

    pub fn color_for_group(&self, group_id: &str) -> Option<String> {
        self.colors.read().ok()?.get(group_id).cloned()
    }

    /// The display color for `event`. The membership color wins over the
    /// color stored on the event, since the group color can change later.
    pub fn resolve(&self, event: &CalendarEvent) -> String {
        if event.is_personal() {
            return event
                .stored_color
                .clone()
                .unwrap_or_else(|| self.personal_color.clone());
        }

        self.color_for_group(&event.group_id)
            .or_else(|| event.stored_color.clone())
            .unwrap_or_else(|| self.default_group_color.clone())
    }

    pub fn apply_to(&self, event: &mut CalendarEvent) {
        event.color = self.resolve(event);
    }

    /// Change a group's color and recolor every loaded event of that group
    /// in place, without resubscribing or fetching.
    pub fn update_color(&self, store: &EventStore, group_id: &str, color: &str) {
        if let Ok(mut guard) = self.colors.write() {
            guard.insert(group_id.to_string(), color.to_string());
        }

        let recolored = store.apply(|events| {
            let mut count = 0;
            for event in events.iter_mut().filter(|e| e.group_id == group_id) {
                event.color = color.to_string();
                count += 1;
            }
            count
        });
        debug!(group_id, recolored, "propagated group color");
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.colors.write() {
            guard.clear();
        }
    }
}
