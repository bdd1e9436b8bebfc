use serde_json::Value;

/// Kinds of events, in the order a batch delivers them. `Error` only
/// appears on cancel events and is never part of a change batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventType {
    ChildRemoved,
    ChildAdded,
    ChildMoved,
    ChildChanged,
    Value,
    Error,
}

impl EventType {
    pub fn is_child_event(self) -> bool {
        matches!(
            self,
            EventType::ChildRemoved
                | EventType::ChildAdded
                | EventType::ChildMoved
                | EventType::ChildChanged
        )
    }
}

/// One observable mutation of a view, before it is routed to listeners.
///
/// `variant` is the new child (or the whole view data for value changes);
/// `old_variant` is the previous child for changes and removals.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub event_type: EventType,
    pub variant: Value,
    pub child_key: String,
    pub prev_name: Option<String>,
    pub old_variant: Value,
}

impl Change {
    fn new(event_type: EventType, child_key: &str, variant: Value, old_variant: Value) -> Self {
        Self {
            event_type,
            variant,
            child_key: child_key.to_string(),
            prev_name: None,
            old_variant,
        }
    }

    pub fn value(variant: Value) -> Self {
        Self::new(EventType::Value, "", variant, Value::Null)
    }

    pub fn child_added(child_key: &str, variant: Value) -> Self {
        Self::new(EventType::ChildAdded, child_key, variant, Value::Null)
    }

    pub fn child_removed(child_key: &str, old_variant: Value) -> Self {
        Self::new(EventType::ChildRemoved, child_key, old_variant, Value::Null)
    }

    pub fn child_changed(child_key: &str, variant: Value, old_variant: Value) -> Self {
        Self::new(EventType::ChildChanged, child_key, variant, old_variant)
    }

    pub fn child_moved(child_key: &str, variant: Value) -> Self {
        Self::new(EventType::ChildMoved, child_key, variant, Value::Null)
    }

    pub fn with_prev_name(mut self, prev_name: Option<String>) -> Self {
        self.prev_name = prev_name;
        self
    }
}
