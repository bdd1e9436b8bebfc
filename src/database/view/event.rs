use crate::database::core::event_registration::{EventRegistration, EventTarget, ListenerId};
use crate::database::error::DatabaseError;
use crate::database::path::Path;
use crate::database::snapshot::DataSnapshot;
use crate::database::view::change::EventType;

/// One delivery to one registration, returned by the sync tree for the
/// caller to fire once the mutation is over.
#[derive(Debug)]
pub struct Event {
    pub event_type: EventType,
    pub target: EventTarget,
    /// Set only on cancel events, which take the registration out of its
    /// view.
    pub registration: Option<EventRegistration>,
    pub snapshot: Option<DataSnapshot>,
    pub prev_name: Option<String>,
    pub error: Option<DatabaseError>,
    pub path: Path,
}

impl Event {
    pub fn new(
        event_type: EventType,
        target: EventTarget,
        snapshot: DataSnapshot,
        prev_name: Option<String>,
    ) -> Self {
        Self {
            event_type,
            path: snapshot.path().clone(),
            target,
            registration: None,
            snapshot: Some(snapshot),
            prev_name,
            error: None,
        }
    }

    /// A cancel event owns the registration it was detached from.
    pub fn cancel(registration: EventRegistration, error: DatabaseError, path: Path) -> Self {
        Self {
            event_type: EventType::Error,
            target: registration.target(),
            registration: Some(registration),
            snapshot: None,
            prev_name: None,
            error: Some(error),
            path,
        }
    }

    pub fn snapshot(&self) -> Option<&DataSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn listener_id(&self) -> ListenerId {
        self.target.listener_id()
    }

    pub fn is_cancel(&self) -> bool {
        self.error.is_some()
    }

    /// Delivers the event unless its registration was removed in the
    /// meantime. A cancel event delivers `on_cancelled` once and leaves the
    /// registration removed.
    pub fn fire(&self) {
        if self.target.is_removed() {
            return;
        }
        match (&self.error, &self.snapshot) {
            (Some(error), _) => {
                self.target.status().mark_removed();
                self.target.fire_cancel_event(error);
            }
            (None, Some(snapshot)) => {
                self.target
                    .fire_event(self.event_type, snapshot, self.prev_name.as_deref());
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::event_registration::ValueListener;
    use crate::database::error::DatabaseErrorCode;
    use crate::database::query::QuerySpec;
    use crate::database::view::change::Change;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl ValueListener for Recorder {
        fn on_value_changed(&self, snapshot: &DataSnapshot) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("value {}", snapshot.value()));
        }

        fn on_cancelled(&self, error: &DatabaseError) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("cancelled {}", error.code_str()));
        }
    }

    fn registration(recorder: &Arc<Recorder>) -> EventRegistration {
        EventRegistration::value(
            QuerySpec::new(Path::new("a")),
            ListenerId::next(),
            recorder.clone(),
        )
    }

    #[test]
    fn removed_registration_is_not_fired() {
        let recorder = Arc::new(Recorder::default());
        let registration = registration(&recorder);
        let event = registration.generate_event(&Change::value(json!(1)), registration.query_spec());
        registration.status().mark_removed();
        event.fire();
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_fires_once_then_silences_registration() {
        let recorder = Arc::new(Recorder::default());
        let registration = registration(&recorder);
        let pending = registration.generate_event(&Change::value(json!(1)), registration.query_spec());
        let cancel = Event::cancel(
            registration,
            DatabaseError::new(DatabaseErrorCode::PermissionDenied, "denied"),
            Path::new("a"),
        );
        assert!(cancel.is_cancel());
        assert!(cancel.registration.is_some());
        assert!(pending.registration.is_none());
        assert_eq!(cancel.listener_id(), pending.listener_id());
        cancel.fire();
        cancel.fire();
        pending.fire();
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["cancelled database/permission-denied".to_string()]
        );
    }
}
