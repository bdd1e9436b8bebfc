//! Listener registrations held by views.
//!
//! A registration ties one listener to one [`QuerySpec`] and is owned by
//! exactly one view. Events carry an [`EventTarget`] sharing the
//! registration's [`RegistrationStatus`], so an [`Event`] produced before a
//! listener was removed observes the removal and is dropped instead of
//! delivered.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::database::error::DatabaseError;
use crate::database::query::QuerySpec;
use crate::database::snapshot::DataSnapshot;
use crate::database::view::change::{Change, EventType};
use crate::database::view::event::Event;
use crate::util::dev_assert;

/// Receives the complete data of a location whenever it changes.
pub trait ValueListener: Send + Sync {
    fn on_value_changed(&self, snapshot: &DataSnapshot);

    fn on_cancelled(&self, error: &DatabaseError);
}

/// Receives per-child events of a location. `previous_sibling_key` is the
/// key of the child sorted just before this one, if any.
pub trait ChildListener: Send + Sync {
    fn on_child_added(&self, snapshot: &DataSnapshot, previous_sibling_key: Option<&str>);

    fn on_child_changed(&self, snapshot: &DataSnapshot, previous_sibling_key: Option<&str>);

    fn on_child_moved(&self, snapshot: &DataSnapshot, previous_sibling_key: Option<&str>);

    fn on_child_removed(&self, snapshot: &DataSnapshot);

    fn on_cancelled(&self, error: &DatabaseError);
}

/// Opaque listener identity used to match registrations on removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub fn next() -> Self {
        static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Removal flag shared by a registration and the targets of its events.
#[derive(Clone, Debug, Default)]
pub struct RegistrationStatus {
    removed: Arc<AtomicBool>,
}

impl RegistrationStatus {
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
pub struct RegistrationBase {
    query_spec: QuerySpec,
    listener_id: ListenerId,
    status: RegistrationStatus,
}

impl RegistrationBase {
    fn new(query_spec: QuerySpec, listener_id: ListenerId) -> Self {
        Self {
            query_spec,
            listener_id,
            status: RegistrationStatus::default(),
        }
    }
}

pub enum EventRegistration {
    Value {
        base: RegistrationBase,
        listener: Arc<dyn ValueListener>,
    },
    Child {
        base: RegistrationBase,
        listener: Arc<dyn ChildListener>,
    },
    /// Keeps a view and its cache alive without delivering anything.
    KeepSynced { base: RegistrationBase },
}

impl fmt::Debug for EventRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            EventRegistration::Value { .. } => "Value",
            EventRegistration::Child { .. } => "Child",
            EventRegistration::KeepSynced { .. } => "KeepSynced",
        };
        let base = self.base();
        f.debug_struct("EventRegistration")
            .field("kind", &kind)
            .field("query_spec", &base.query_spec)
            .field("listener_id", &base.listener_id)
            .field("removed", &base.status.is_removed())
            .finish()
    }
}

impl EventRegistration {
    pub fn value(
        query_spec: QuerySpec,
        listener_id: ListenerId,
        listener: Arc<dyn ValueListener>,
    ) -> Self {
        EventRegistration::Value {
            base: RegistrationBase::new(query_spec, listener_id),
            listener,
        }
    }

    pub fn child(
        query_spec: QuerySpec,
        listener_id: ListenerId,
        listener: Arc<dyn ChildListener>,
    ) -> Self {
        EventRegistration::Child {
            base: RegistrationBase::new(query_spec, listener_id),
            listener,
        }
    }

    /// `owner` is the id of the sync tree keeping the query synced.
    pub fn keep_synced(query_spec: QuerySpec, owner: ListenerId) -> Self {
        EventRegistration::KeepSynced {
            base: RegistrationBase::new(query_spec, owner),
        }
    }

    fn base(&self) -> &RegistrationBase {
        match self {
            EventRegistration::Value { base, .. }
            | EventRegistration::Child { base, .. }
            | EventRegistration::KeepSynced { base } => base,
        }
    }

    pub fn query_spec(&self) -> &QuerySpec {
        &self.base().query_spec
    }

    pub fn listener_id(&self) -> ListenerId {
        self.base().listener_id
    }

    pub fn status(&self) -> &RegistrationStatus {
        &self.base().status
    }

    pub fn is_removed(&self) -> bool {
        self.status().is_removed()
    }

    /// The delivery handle events of this registration fire through.
    pub fn target(&self) -> EventTarget {
        let listener = match self {
            EventRegistration::Value { listener, .. } => TargetListener::Value(listener.clone()),
            EventRegistration::Child { listener, .. } => TargetListener::Child(listener.clone()),
            EventRegistration::KeepSynced { .. } => TargetListener::Nobody,
        };
        let base = self.base();
        EventTarget {
            listener_id: base.listener_id,
            status: base.status.clone(),
            listener,
        }
    }

    pub fn responds_to(&self, event_type: EventType) -> bool {
        match self {
            EventRegistration::Value { .. } => event_type == EventType::Value,
            EventRegistration::Child { .. } => event_type.is_child_event(),
            EventRegistration::KeepSynced { .. } => false,
        }
    }

    pub fn matches_listener(&self, listener_id: ListenerId) -> bool {
        self.listener_id() == listener_id
    }

    /// Builds the event for `change` at the location `query_spec` describes.
    pub fn generate_event(&self, change: &Change, query_spec: &QuerySpec) -> Event {
        dev_assert(
            self.responds_to(change.event_type),
            format!(
                "Registration does not respond to {:?} events",
                change.event_type
            ),
        );
        let snapshot_spec = if change.event_type == EventType::Value {
            query_spec.clone()
        } else {
            QuerySpec::new(query_spec.path.child(&change.child_key))
        };
        Event::new(
            change.event_type,
            self.target(),
            DataSnapshot::new(change.variant.clone(), snapshot_spec),
            change.prev_name.clone(),
        )
    }
}

#[derive(Clone)]
enum TargetListener {
    Value(Arc<dyn ValueListener>),
    Child(Arc<dyn ChildListener>),
    Nobody,
}

/// The listener and removal flag of one registration, without the
/// registration itself.
#[derive(Clone)]
pub struct EventTarget {
    listener_id: ListenerId,
    status: RegistrationStatus,
    listener: TargetListener,
}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("listener_id", &self.listener_id)
            .field("removed", &self.status.is_removed())
            .finish()
    }
}

impl EventTarget {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn status(&self) -> &RegistrationStatus {
        &self.status
    }

    pub fn is_removed(&self) -> bool {
        self.status.is_removed()
    }

    pub(crate) fn fire_event(&self, event_type: EventType, snapshot: &DataSnapshot, prev_name: Option<&str>) {
        match &self.listener {
            TargetListener::Value(listener) => {
                if event_type == EventType::Value {
                    listener.on_value_changed(snapshot);
                }
            }
            TargetListener::Child(listener) => match event_type {
                EventType::ChildAdded => listener.on_child_added(snapshot, prev_name),
                EventType::ChildChanged => listener.on_child_changed(snapshot, prev_name),
                EventType::ChildMoved => listener.on_child_moved(snapshot, prev_name),
                EventType::ChildRemoved => listener.on_child_removed(snapshot),
                EventType::Value | EventType::Error => {}
            },
            TargetListener::Nobody => {}
        }
    }

    pub(crate) fn fire_cancel_event(&self, error: &DatabaseError) {
        match &self.listener {
            TargetListener::Value(listener) => listener.on_cancelled(error),
            TargetListener::Child(listener) => listener.on_cancelled(error),
            TargetListener::Nobody => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::path::Path;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingValueListener {
        values: Mutex<Vec<serde_json::Value>>,
    }

    impl ValueListener for RecordingValueListener {
        fn on_value_changed(&self, snapshot: &DataSnapshot) {
            self.values.lock().unwrap().push(snapshot.value().clone());
        }

        fn on_cancelled(&self, _error: &DatabaseError) {}
    }

    #[test]
    fn listener_ids_are_unique() {
        let first = ListenerId::next();
        let second = ListenerId::next();
        assert_ne!(first, second);
        assert!(second.value() > first.value());
    }

    #[test]
    fn responds_to_matches_registration_kind() {
        let spec = QuerySpec::new(Path::new("a"));
        let listener = Arc::new(RecordingValueListener::default());
        let value = EventRegistration::value(spec.clone(), ListenerId::next(), listener);
        assert!(value.responds_to(EventType::Value));
        assert!(!value.responds_to(EventType::ChildAdded));

        let keep_synced = EventRegistration::keep_synced(spec, ListenerId::next());
        assert!(!keep_synced.responds_to(EventType::Value));
        assert!(!keep_synced.responds_to(EventType::ChildRemoved));
    }

    #[test]
    fn targets_share_removal_status() {
        let spec = QuerySpec::new(Path::new("a"));
        let id = ListenerId::next();
        let registration = EventRegistration::value(
            spec,
            id,
            Arc::new(RecordingValueListener::default()),
        );
        let target = registration.target();
        assert_eq!(target.listener_id(), id);
        registration.status().mark_removed();
        assert!(target.is_removed());
    }

    #[test]
    fn value_event_fires_listener() {
        let spec = QuerySpec::new(Path::new("a"));
        let listener = Arc::new(RecordingValueListener::default());
        let registration = EventRegistration::value(spec.clone(), ListenerId::next(), listener.clone());
        let event = registration.generate_event(&Change::value(json!({ "b": 1 })), &spec);
        assert_eq!(event.snapshot().map(|s| s.path().clone()), Some(Path::new("a")));
        event.fire();
        assert_eq!(*listener.values.lock().unwrap(), vec![json!({ "b": 1 })]);
    }

    #[derive(Default)]
    struct RecordingChildListener {
        events: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ChildListener for RecordingChildListener {
        fn on_child_added(&self, snapshot: &DataSnapshot, previous: Option<&str>) {
            self.record("added", snapshot, previous);
        }

        fn on_child_changed(&self, snapshot: &DataSnapshot, previous: Option<&str>) {
            self.record("changed", snapshot, previous);
        }

        fn on_child_moved(&self, snapshot: &DataSnapshot, previous: Option<&str>) {
            self.record("moved", snapshot, previous);
        }

        fn on_child_removed(&self, snapshot: &DataSnapshot) {
            self.record("removed", snapshot, None);
        }

        fn on_cancelled(&self, _error: &DatabaseError) {}
    }

    impl RecordingChildListener {
        fn record(&self, kind: &str, snapshot: &DataSnapshot, previous: Option<&str>) {
            self.events
                .lock()
                .unwrap()
                .push((format!("{kind} {}", snapshot.path()), previous.map(str::to_string)));
        }
    }

    #[test]
    fn child_event_snapshot_points_at_child() {
        let spec = QuerySpec::new(Path::new("a"));
        let listener = Arc::new(RecordingChildListener::default());
        let registration = EventRegistration::child(spec.clone(), ListenerId::next(), listener.clone());
        let change = Change::child_added("c", json!(1)).with_prev_name(Some("b".to_string()));
        registration.generate_event(&change, &spec).fire();
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec![("added a/c".to_string(), Some("b".to_string()))]
        );
    }
}
