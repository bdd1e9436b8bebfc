use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use firebase_database_sync::database::view::view::View;
use firebase_database_sync::database::{
    AckStatus, ChildListener, DataSnapshot, DatabaseError, DatabaseErrorCode, Event,
    EventRegistration, EventType, InMemoryPersistenceManager, ListenProvider, ListenerId,
    NoopListenProvider, NoopPersistenceManager, OverwriteVisibility, Path, PersistenceManager,
    QueryParams, QuerySpec, SyncTree, Tag, ValueListener,
};
use serde_json::{json, Value};

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }
}

impl ValueListener for Recorder {
    fn on_value_changed(&self, snapshot: &DataSnapshot) {
        self.push(format!("value {}", snapshot.value()));
    }

    fn on_cancelled(&self, error: &DatabaseError) {
        self.push(format!("cancelled {}", error.code_str()));
    }
}

impl ChildListener for Recorder {
    fn on_child_added(&self, snapshot: &DataSnapshot, previous: Option<&str>) {
        self.push(format!("added {} after {previous:?}", snapshot.key().unwrap_or_default()));
    }

    fn on_child_changed(&self, snapshot: &DataSnapshot, previous: Option<&str>) {
        self.push(format!("changed {} after {previous:?}", snapshot.key().unwrap_or_default()));
    }

    fn on_child_moved(&self, snapshot: &DataSnapshot, previous: Option<&str>) {
        self.push(format!("moved {} after {previous:?}", snapshot.key().unwrap_or_default()));
    }

    fn on_child_removed(&self, snapshot: &DataSnapshot) {
        self.push(format!("removed {}", snapshot.key().unwrap_or_default()));
    }

    fn on_cancelled(&self, error: &DatabaseError) {
        self.push(format!("cancelled {}", error.code_str()));
    }
}

#[derive(Clone, Default)]
struct CountingListenProvider {
    started: Arc<Mutex<Vec<(QuerySpec, Option<Tag>)>>>,
    stopped: Arc<Mutex<Vec<(QuerySpec, Option<Tag>)>>>,
}

impl ListenProvider for CountingListenProvider {
    fn start_listening(&self, query_spec: &QuerySpec, tag: Option<Tag>, _view: &View) {
        self.started.lock().unwrap().push((query_spec.clone(), tag));
    }

    fn stop_listening(&self, query_spec: &QuerySpec, tag: Option<Tag>) {
        self.stopped.lock().unwrap().push((query_spec.clone(), tag));
    }
}

fn new_tree() -> SyncTree {
    SyncTree::new(Box::new(NoopPersistenceManager), Box::new(NoopListenProvider))
}

fn fire_all(events: &[Event]) {
    for event in events {
        event.fire();
    }
}

fn value_values(events: &[Event]) -> Vec<Value> {
    events
        .iter()
        .filter(|event| event.event_type == EventType::Value)
        .filter_map(|event| event.snapshot().map(|snapshot| snapshot.value().clone()))
        .collect()
}

#[test]
fn server_data_user_write_and_revert_scenario() {
    let mut tree = new_tree();
    let spec = QuerySpec::new(Path::new("a/b"));
    let recorder = Arc::new(Recorder::default());
    let initial = tree.add_event_registration(EventRegistration::value(
        spec,
        ListenerId::next(),
        recorder.clone(),
    ));
    assert!(initial.is_empty());

    let events = tree.apply_server_overwrite(&Path::new("a/b"), json!(42));
    assert_eq!(events.len(), 1);
    assert_eq!(value_values(&events), vec![json!(42)]);

    let events = tree.apply_user_overwrite(
        &Path::new("a/b"),
        json!(43),
        1,
        OverwriteVisibility::Visible,
        false,
    );
    assert_eq!(events.len(), 1);
    assert_eq!(value_values(&events), vec![json!(43)]);

    let events = tree.ack_user_write(1, AckStatus::Revert, false, 0);
    assert_eq!(events.len(), 1);
    assert_eq!(value_values(&events), vec![json!(42)]);

    fire_all(&events);
    assert_eq!(recorder.take(), vec!["value 42".to_string()]);
}

#[test]
fn events_are_ordered_by_type_then_by_child_order() {
    let mut tree = new_tree();
    let spec = QuerySpec::new(Path::new("list"));
    let recorder = Arc::new(Recorder::default());
    tree.add_event_registration(EventRegistration::child(
        spec.clone(),
        ListenerId::next(),
        recorder.clone(),
    ));
    tree.add_event_registration(EventRegistration::value(
        spec,
        ListenerId::next(),
        recorder.clone(),
    ));

    fire_all(&tree.apply_server_overwrite(&Path::new("list"), json!({ "a": 1, "b": 2, "c": 3 })));
    assert_eq!(
        recorder.take(),
        vec![
            "added a after None".to_string(),
            "added b after Some(\"a\")".to_string(),
            "added c after Some(\"b\")".to_string(),
            "value {\"a\":1,\"b\":2,\"c\":3}".to_string(),
        ]
    );

    let merge = BTreeMap::from([
        (Path::new("b"), json!(20)),
        (Path::new("c"), Value::Null),
        (Path::new("d"), json!(4)),
    ]);
    let events = tree.apply_server_merge(&Path::new("list"), &merge);
    let types: Vec<EventType> = events.iter().map(|event| event.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::ChildRemoved,
            EventType::ChildAdded,
            EventType::ChildChanged,
            EventType::Value,
        ]
    );
    fire_all(&events);
    assert_eq!(
        recorder.take(),
        vec![
            "removed c".to_string(),
            "added d after Some(\"b\")".to_string(),
            "changed b after Some(\"a\")".to_string(),
            "value {\"a\":1,\"b\":20,\"d\":4}".to_string(),
        ]
    );
}

#[test]
fn confirmed_write_matches_server_data_without_events() {
    let persistence = InMemoryPersistenceManager::new();
    let mut tree = SyncTree::new(Box::new(persistence.clone()), Box::new(NoopListenProvider));
    let spec = QuerySpec::new(Path::new("x"));
    tree.add_event_registration(EventRegistration::value(
        spec,
        ListenerId::next(),
        Arc::new(Recorder::default()),
    ));
    tree.apply_server_overwrite(&Path::new("x"), json!(1));

    let events = tree.apply_user_overwrite(
        &Path::new("x"),
        json!(2),
        1,
        OverwriteVisibility::Visible,
        true,
    );
    assert_eq!(value_values(&events), vec![json!(2)]);

    // The server echoes the write before acknowledging it.
    assert!(tree.apply_server_overwrite(&Path::new("x"), json!(2)).is_empty());
    assert!(tree.ack_user_write(1, AckStatus::Confirm, true, 0).is_empty());
    assert_eq!(persistence.server_cache_at(&Path::new("x")), json!(2));
    assert!(persistence.load_user_writes().is_empty());
}

#[test]
fn confirmed_write_without_listeners_lands_in_server_cache() {
    let persistence = InMemoryPersistenceManager::new();
    let mut tree = SyncTree::new(Box::new(persistence.clone()), Box::new(NoopListenProvider));
    let value = json!({ "name": "ada", "tags": { "x": true } });
    assert!(tree
        .apply_user_overwrite(
            &Path::new("users/1"),
            value.clone(),
            1,
            OverwriteVisibility::Visible,
            true,
        )
        .is_empty());
    assert!(tree.ack_user_write(1, AckStatus::Confirm, true, 0).is_empty());
    assert_eq!(persistence.server_cache_at(&Path::new("users/1")), value);
}

#[test]
fn removing_all_writes_reverts_merges() {
    let mut tree = new_tree();
    let spec = QuerySpec::new(Path::new("m"));
    tree.add_event_registration(EventRegistration::value(
        spec,
        ListenerId::next(),
        Arc::new(Recorder::default()),
    ));
    tree.apply_server_overwrite(&Path::new("m"), json!({ "a": 1, "b": 2 }));

    let mut update = serde_json::Map::new();
    update.insert("a".to_string(), json!(10));
    let events = tree.apply_user_update(&Path::new("m"), &update, 1);
    assert_eq!(value_values(&events), vec![json!({ "a": 10, "b": 2 })]);

    let events = tree.remove_all_writes();
    assert_eq!(value_values(&events), vec![json!({ "a": 1, "b": 2 })]);
    assert!(tree.remove_all_writes().is_empty());
}

#[test]
fn server_cache_completeness_never_regresses() {
    let mut tree = new_tree();
    let spec = QuerySpec::new(Path::new("c"));
    tree.add_event_registration(EventRegistration::value(
        spec.clone(),
        ListenerId::next(),
        Arc::new(Recorder::default()),
    ));
    let server_complete = |tree: &SyncTree| {
        tree.sync_point(&spec.path)
            .and_then(|sync_point| sync_point.complete_view())
            .map(|view| view.view_cache().server_snap().fully_initialized())
    };
    assert_eq!(server_complete(&tree), Some(false));

    let events = tree.apply_listen_complete(&Path::new("c"));
    assert_eq!(value_values(&events), vec![Value::Null]);
    assert_eq!(server_complete(&tree), Some(true));

    tree.apply_user_overwrite(&Path::new("c/k"), json!(1), 1, OverwriteVisibility::Visible, false);
    assert_eq!(server_complete(&tree), Some(true));
    tree.ack_user_write(1, AckStatus::Revert, false, 0);
    assert_eq!(server_complete(&tree), Some(true));
    tree.apply_server_merge(&Path::new("c"), &BTreeMap::from([(Path::new("k"), json!(2))]));
    assert_eq!(server_complete(&tree), Some(true));
    tree.apply_server_overwrite(&Path::new("c/k"), Value::Null);
    assert_eq!(server_complete(&tree), Some(true));
}

#[test]
fn default_listener_shadows_descendant_queries() {
    let provider = CountingListenProvider::default();
    let mut tree = SyncTree::new(Box::new(NoopPersistenceManager), Box::new(provider.clone()));
    let parent = QuerySpec::new(Path::new("a"));
    let filtered = QuerySpec::with_params(
        Path::new("a/b/c"),
        QueryParams::new()
            .order_by_value()
            .and_then(|params| params.limit_to_last(3))
            .unwrap(),
    );
    tree.add_event_registration(EventRegistration::value(
        parent.clone(),
        ListenerId::next(),
        Arc::new(Recorder::default()),
    ));
    tree.add_event_registration(EventRegistration::value(
        filtered.clone(),
        ListenerId::next(),
        Arc::new(Recorder::default()),
    ));
    tree.add_event_registration(EventRegistration::value(
        QuerySpec::new(Path::new("a/b")),
        ListenerId::next(),
        Arc::new(Recorder::default()),
    ));

    assert_eq!(*provider.started.lock().unwrap(), vec![(parent, None)]);
    assert!(provider.stopped.lock().unwrap().is_empty());
    assert!(tree.tag_for_query_spec(&filtered).is_some());
}

#[test]
fn default_listener_stops_existing_descendant_listens() {
    let provider = CountingListenProvider::default();
    let mut tree = SyncTree::new(Box::new(NoopPersistenceManager), Box::new(provider.clone()));
    let child = QuerySpec::new(Path::new("a/b"));
    tree.add_event_registration(EventRegistration::value(
        child.clone(),
        ListenerId::next(),
        Arc::new(Recorder::default()),
    ));
    tree.add_event_registration(EventRegistration::value(
        QuerySpec::new(Path::new("a")),
        ListenerId::next(),
        Arc::new(Recorder::default()),
    ));

    assert_eq!(provider.started.lock().unwrap().len(), 2);
    assert_eq!(*provider.stopped.lock().unwrap(), vec![(child, None)]);
}

#[test]
fn cancel_detaches_every_listener_exactly_once() {
    let mut tree = new_tree();
    let spec = QuerySpec::new(Path::new("q"));
    let recorders: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
    for recorder in &recorders {
        tree.add_event_registration(EventRegistration::value(
            spec.clone(),
            ListenerId::next(),
            recorder.clone(),
        ));
    }
    let stale = tree.apply_server_overwrite(&Path::new("q"), json!("v"));
    assert_eq!(stale.len(), 3);

    let error = DatabaseError::new(DatabaseErrorCode::PermissionDenied, "no access");
    let cancels = tree.remove_all_event_registrations(&spec, &error);
    assert_eq!(cancels.len(), 3);
    assert!(cancels.iter().all(Event::is_cancel));
    let mut ids: Vec<ListenerId> = cancels
        .iter()
        .map(Event::listener_id)
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3);

    fire_all(&cancels);
    fire_all(&cancels);
    fire_all(&stale);
    for recorder in &recorders {
        assert_eq!(
            recorder.take(),
            vec!["cancelled database/permission-denied".to_string()]
        );
    }

    assert!(tree.is_empty());
    assert!(tree.apply_server_overwrite(&Path::new("q"), json!("w")).is_empty());
}
