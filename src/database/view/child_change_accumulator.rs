use std::collections::BTreeMap;

use crate::database::variant::is_priority_key;
use crate::database::view::change::{Change, EventType};
use crate::util::{assert, dev_assert};

/// Collects child changes for one operation, collapsing successive changes
/// to the same key into the single change a listener should see.
#[derive(Clone, Debug, Default)]
pub struct ChildChangeAccumulator {
    changes: BTreeMap<String, Change>,
}

impl ChildChangeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_child_change(&mut self, change: Change) {
        let event_type = change.event_type;
        dev_assert(
            matches!(
                event_type,
                EventType::ChildAdded | EventType::ChildChanged | EventType::ChildRemoved
            ),
            "Only child changes supported for tracking",
        );
        dev_assert(
            !is_priority_key(&change.child_key),
            "Changes not tracked on priority",
        );
        let key = change.child_key.clone();
        let Some(old) = self.changes.remove(&key) else {
            self.changes.insert(key, change);
            return;
        };
        let merged = match (event_type, old.event_type) {
            (EventType::ChildAdded, EventType::ChildRemoved) => Some(Change::child_changed(
                &key,
                change.variant,
                old.variant,
            )),
            (EventType::ChildRemoved, EventType::ChildAdded) => None,
            (EventType::ChildRemoved, EventType::ChildChanged) => {
                Some(Change::child_removed(&key, old.old_variant))
            }
            (EventType::ChildChanged, EventType::ChildAdded) => {
                Some(Change::child_added(&key, change.variant))
            }
            (EventType::ChildChanged, EventType::ChildChanged) => Some(Change::child_changed(
                &key,
                change.variant,
                old.old_variant,
            )),
            (new_type, old_type) => {
                assert(
                    false,
                    format!("Illegal combination of changes: {new_type:?} occurred after {old_type:?}"),
                );
                None
            }
        };
        if let Some(merged) = merged {
            self.changes.insert(key, merged);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// The collapsed changes in key order.
    pub fn into_changes(self) -> Vec<Change> {
        self.changes.into_values().collect()
    }
}
