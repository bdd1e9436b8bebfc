//! Storage collaborator of the sync tree.
//!
//! The sync tree reports every write and every piece of server data to a
//! [`PersistenceManager`] and asks it for cached server data when a new view
//! is created without a complete ancestor. Two implementations ship with the
//! crate: [`NoopPersistenceManager`], which caches nothing, and
//! [`InMemoryPersistenceManager`], which keeps the cache and the tracked
//! query bookkeeping in process memory.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::{Map, Value};

use crate::database::core::compound_write::CompoundWrite;
use crate::database::core::tree::Tree;
use crate::database::core::write_tree::{UserWrite, UserWriteRecord, WriteId};
use crate::database::path::Path;
use crate::database::query::{QueryParams, QuerySpec};
use crate::database::variant::{children, get_child, get_immediate_child, update_child};
use crate::database::view::indexed_variant::IndexedVariant;
use crate::database::view::view_cache::CacheNode;
use crate::util::dev_assert;

/// Server data to fold into the cache.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerCacheUpdate {
    /// Complete data for a query. A filtered query only overwrites the
    /// children it returned.
    Overwrite(QuerySpec, Value),
    Merge(Path, CompoundWrite),
}

pub trait PersistenceManager: Send + Sync {
    fn begin_transaction(&self);

    fn set_transaction_successful(&self);

    fn end_transaction(&self);

    fn save_user_overwrite(&self, path: &Path, value: &Value, write_id: WriteId);

    fn save_user_merge(&self, path: &Path, merge: &CompoundWrite, write_id: WriteId);

    fn remove_user_write(&self, write_id: WriteId);

    fn remove_all_user_writes(&self);

    /// Pending writes in the order they were made.
    fn load_user_writes(&self) -> Vec<UserWriteRecord>;

    /// Caches an acknowledged write as server data.
    fn apply_user_write_to_server_cache(&self, path: &Path, write: &UserWrite);

    /// Cached server data for `query_spec`, complete or not.
    fn server_cache(&self, query_spec: &QuerySpec) -> CacheNode;

    fn update_server_cache(&self, update: ServerCacheUpdate);

    fn set_query_active(&self, query_spec: &QuerySpec);

    fn set_query_inactive(&self, query_spec: &QuerySpec);

    fn set_query_complete(&self, query_spec: &QuerySpec);

    /// Replaces the children a filtered query is known to contain.
    fn set_tracked_query_keys(&self, query_spec: &QuerySpec, keys: &BTreeSet<String>);

    fn update_tracked_query_keys(
        &self,
        query_spec: &QuerySpec,
        added: &BTreeSet<String>,
        removed: &BTreeSet<String>,
    );
}

/// Persists nothing. Every cache read is empty and incomplete.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPersistenceManager;

impl PersistenceManager for NoopPersistenceManager {
    fn begin_transaction(&self) {}

    fn set_transaction_successful(&self) {}

    fn end_transaction(&self) {}

    fn save_user_overwrite(&self, _path: &Path, _value: &Value, _write_id: WriteId) {}

    fn save_user_merge(&self, _path: &Path, _merge: &CompoundWrite, _write_id: WriteId) {}

    fn remove_user_write(&self, _write_id: WriteId) {}

    fn remove_all_user_writes(&self) {}

    fn load_user_writes(&self) -> Vec<UserWriteRecord> {
        Vec::new()
    }

    fn apply_user_write_to_server_cache(&self, _path: &Path, _write: &UserWrite) {}

    fn server_cache(&self, query_spec: &QuerySpec) -> CacheNode {
        CacheNode::new(
            IndexedVariant::with_params(Value::Null, query_spec.params.clone()),
            false,
            false,
        )
    }

    fn update_server_cache(&self, _update: ServerCacheUpdate) {}

    fn set_query_active(&self, _query_spec: &QuerySpec) {}

    fn set_query_inactive(&self, _query_spec: &QuerySpec) {}

    fn set_query_complete(&self, _query_spec: &QuerySpec) {}

    fn set_tracked_query_keys(&self, _query_spec: &QuerySpec, _keys: &BTreeSet<String>) {}

    fn update_tracked_query_keys(
        &self,
        _query_spec: &QuerySpec,
        _added: &BTreeSet<String>,
        _removed: &BTreeSet<String>,
    ) {
    }
}

/// Bookkeeping for one query the cache holds data for.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedQuery {
    pub query_id: u64,
    pub query_spec: QuerySpec,
    /// Milliseconds since the epoch of the last activity change.
    pub last_use: i64,
    pub complete: bool,
    pub active: bool,
}

#[derive(Debug, Default)]
struct PersistenceState {
    server_cache: Value,
    user_writes: BTreeMap<WriteId, UserWriteRecord>,
    tracked_queries: Tree<BTreeMap<QueryParams, TrackedQuery>>,
    tracked_keys: BTreeMap<u64, BTreeSet<String>>,
    next_query_id: u64,
    in_transaction: bool,
}

/// Queries that load all data share one tracked entry per location.
fn normalize(query_spec: &QuerySpec) -> QuerySpec {
    if query_spec.loads_all_data() {
        query_spec.default_form()
    } else {
        query_spec.clone()
    }
}

fn has_default_matching<F>(queries: &BTreeMap<QueryParams, TrackedQuery>, predicate: F) -> bool
where
    F: Fn(&TrackedQuery) -> bool,
{
    queries
        .get(&QueryParams::default())
        .is_some_and(predicate)
}

impl PersistenceState {
    fn tracked_query(&self, query_spec: &QuerySpec) -> Option<&TrackedQuery> {
        let query_spec = normalize(query_spec);
        self.tracked_queries
            .get_value_at(&query_spec.path)
            .and_then(|queries| queries.get(&query_spec.params))
    }

    fn tracked_query_mut(&mut self, query_spec: &QuerySpec) -> Option<&mut TrackedQuery> {
        let query_spec = normalize(query_spec);
        self.tracked_queries
            .get_child_mut(&query_spec.path)
            .and_then(Tree::value_mut)
            .and_then(|queries| queries.get_mut(&query_spec.params))
    }

    fn insert_tracked_query(&mut self, query_spec: &QuerySpec, complete: bool, active: bool) {
        let query_spec = normalize(query_spec);
        self.next_query_id += 1;
        let tracked = TrackedQuery {
            query_id: self.next_query_id,
            query_spec: query_spec.clone(),
            last_use: Utc::now().timestamp_millis(),
            complete,
            active,
        };
        let node = self.tracked_queries.get_or_make_subtree(&query_spec.path);
        let mut queries = node.take_value().unwrap_or_default();
        queries.insert(query_spec.params, tracked);
        node.set_value(Some(queries));
    }

    fn has_active_default_query(&self, path: &Path) -> bool {
        self.tracked_queries
            .find_root_most_matching_path(path, |queries| {
                has_default_matching(queries, |tracked| tracked.active)
            })
            .is_some()
    }

    fn is_included_in_default_complete_query(&self, path: &Path) -> bool {
        self.tracked_queries
            .find_root_most_matching_path(path, |queries| {
                has_default_matching(queries, |tracked| tracked.complete)
            })
            .is_some()
    }

    fn is_query_complete(&self, query_spec: &QuerySpec) -> bool {
        if self.is_included_in_default_complete_query(&query_spec.path) {
            true
        } else if query_spec.loads_all_data() {
            false
        } else {
            self.tracked_query(query_spec)
                .is_some_and(|tracked| tracked.complete)
        }
    }

    fn ensure_complete_tracked_query(&mut self, path: &Path) {
        if self.is_included_in_default_complete_query(path) {
            return;
        }
        let query_spec = QuerySpec::new(path.clone());
        match self.tracked_query_mut(&query_spec) {
            Some(tracked) => {
                tracked.complete = true;
                tracked.last_use = Utc::now().timestamp_millis();
            }
            None => self.insert_tracked_query(&query_spec, true, false),
        }
    }

    /// Keys of children known to be complete below `path`: those returned
    /// by complete filtered queries at `path` plus those covered by a
    /// complete default query further down.
    fn known_complete_children(&self, path: &Path) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        let Some(subtree) = self.tracked_queries.get_child(path) else {
            return keys;
        };
        if let Some(queries) = subtree.value() {
            for tracked in queries.values() {
                if tracked.complete && !tracked.query_spec.loads_all_data() {
                    if let Some(tracked_keys) = self.tracked_keys.get(&tracked.query_id) {
                        keys.extend(tracked_keys.iter().cloned());
                    }
                }
            }
        }
        for (key, child) in subtree.children() {
            let complete = child
                .value()
                .is_some_and(|queries| has_default_matching(queries, |tracked| tracked.complete));
            if complete {
                keys.insert(key.clone());
            }
        }
        keys
    }

    fn write_server_cache(&mut self, path: &Path, value: Value) {
        update_child(&mut self.server_cache, path, value);
    }
}

/// Keeps the server cache, pending writes and tracked queries in memory.
///
/// Clones share the same state, so a test can hand one clone to a sync tree
/// and inspect the other.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPersistenceManager {
    state: Arc<Mutex<PersistenceState>>,
}

impl InMemoryPersistenceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PersistenceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw cached server data at `path`.
    pub fn server_cache_at(&self, path: &Path) -> Value {
        get_child(&self.state().server_cache, path).clone()
    }

    pub fn tracked_query(&self, query_spec: &QuerySpec) -> Option<TrackedQuery> {
        self.state().tracked_query(query_spec).cloned()
    }

    pub fn tracked_query_keys(&self, query_spec: &QuerySpec) -> BTreeSet<String> {
        let state = self.state();
        state
            .tracked_query(query_spec)
            .and_then(|tracked| state.tracked_keys.get(&tracked.query_id))
            .cloned()
            .unwrap_or_default()
    }
}

impl PersistenceManager for InMemoryPersistenceManager {
    fn begin_transaction(&self) {
        let mut state = self.state();
        dev_assert(
            !state.in_transaction,
            "Persistence transactions must not be nested",
        );
        state.in_transaction = true;
    }

    fn set_transaction_successful(&self) {}

    fn end_transaction(&self) {
        self.state().in_transaction = false;
    }

    fn save_user_overwrite(&self, path: &Path, value: &Value, write_id: WriteId) {
        self.state().user_writes.insert(
            write_id,
            UserWriteRecord::overwrite(write_id, path.clone(), value.clone(), true),
        );
    }

    fn save_user_merge(&self, path: &Path, merge: &CompoundWrite, write_id: WriteId) {
        self.state().user_writes.insert(
            write_id,
            UserWriteRecord::merge(write_id, path.clone(), merge.clone()),
        );
    }

    fn remove_user_write(&self, write_id: WriteId) {
        self.state().user_writes.remove(&write_id);
    }

    fn remove_all_user_writes(&self) {
        self.state().user_writes.clear();
    }

    fn load_user_writes(&self) -> Vec<UserWriteRecord> {
        self.state().user_writes.values().cloned().collect()
    }

    fn apply_user_write_to_server_cache(&self, path: &Path, write: &UserWrite) {
        let mut state = self.state();
        // Data under an active default listen arrives from the server anyway.
        match write {
            UserWrite::Overwrite(value) => {
                if !state.has_active_default_query(path) {
                    state.write_server_cache(path, value.clone());
                    state.ensure_complete_tracked_query(path);
                }
            }
            UserWrite::Merge(merge) => {
                merge.write_tree().call_on_each(&mut |relative, value| {
                    let write_path = path.child_path(relative);
                    if !state.has_active_default_query(&write_path) {
                        state.write_server_cache(&write_path, value.clone());
                        state.ensure_complete_tracked_query(&write_path);
                    }
                });
            }
        }
    }

    fn server_cache(&self, query_spec: &QuerySpec) -> CacheNode {
        let state = self.state();
        let (complete, tracked_keys) = if state.is_query_complete(query_spec) {
            let keys = if query_spec.loads_all_data() {
                None
            } else {
                state
                    .tracked_query(query_spec)
                    .and_then(|tracked| state.tracked_keys.get(&tracked.query_id))
                    .cloned()
            };
            (true, keys)
        } else {
            (false, Some(state.known_complete_children(&query_spec.path)))
        };

        let cached = get_child(&state.server_cache, &query_spec.path);
        let data = match &tracked_keys {
            Some(keys) => {
                let mut filtered = Map::new();
                for key in keys {
                    let child = get_immediate_child(cached, key);
                    if !child.is_null() {
                        filtered.insert(key.clone(), child.clone());
                    }
                }
                if filtered.is_empty() {
                    Value::Null
                } else {
                    Value::Object(filtered)
                }
            }
            None => cached.clone(),
        };
        CacheNode::new(
            IndexedVariant::with_params(data, query_spec.params.clone()),
            complete,
            tracked_keys.is_some(),
        )
    }

    fn update_server_cache(&self, update: ServerCacheUpdate) {
        let mut state = self.state();
        match update {
            ServerCacheUpdate::Overwrite(query_spec, value) => {
                if query_spec.loads_all_data() {
                    state.write_server_cache(&query_spec.path, value);
                } else {
                    let entries: Vec<(String, Value)> = children(&value)
                        .map(|(key, child)| (key.clone(), child.clone()))
                        .collect();
                    for (key, child) in entries {
                        state.write_server_cache(&query_spec.path.child(&key), child);
                    }
                }
            }
            ServerCacheUpdate::Merge(path, merge) => {
                merge.write_tree().call_on_each(&mut |relative, value| {
                    state.write_server_cache(&path.child_path(relative), value.clone());
                });
            }
        }
    }

    fn set_query_active(&self, query_spec: &QuerySpec) {
        let mut state = self.state();
        match state.tracked_query_mut(query_spec) {
            Some(tracked) => {
                tracked.active = true;
                tracked.last_use = Utc::now().timestamp_millis();
            }
            None => state.insert_tracked_query(query_spec, false, true),
        }
    }

    fn set_query_inactive(&self, query_spec: &QuerySpec) {
        let mut state = self.state();
        match state.tracked_query_mut(query_spec) {
            Some(tracked) => {
                tracked.active = false;
                tracked.last_use = Utc::now().timestamp_millis();
            }
            None => log::warn!("Deactivating untracked query {query_spec}"),
        }
    }

    fn set_query_complete(&self, query_spec: &QuerySpec) {
        let mut state = self.state();
        if query_spec.loads_all_data() {
            // A complete default query covers every query below it.
            if let Some(subtree) = state.tracked_queries.get_child_mut(&query_spec.path) {
                mark_complete(subtree);
            }
        } else if let Some(tracked) = state.tracked_query_mut(query_spec) {
            tracked.complete = true;
        }
    }

    fn set_tracked_query_keys(&self, query_spec: &QuerySpec, keys: &BTreeSet<String>) {
        let mut state = self.state();
        let Some(query_id) = state.tracked_query(query_spec).map(|tracked| tracked.query_id) else {
            log::warn!("Tracking keys for untracked query {query_spec}");
            return;
        };
        state.tracked_keys.insert(query_id, keys.clone());
    }

    fn update_tracked_query_keys(
        &self,
        query_spec: &QuerySpec,
        added: &BTreeSet<String>,
        removed: &BTreeSet<String>,
    ) {
        let mut state = self.state();
        let Some(query_id) = state.tracked_query(query_spec).map(|tracked| tracked.query_id) else {
            log::warn!("Tracking keys for untracked query {query_spec}");
            return;
        };
        let keys = state.tracked_keys.entry(query_id).or_default();
        for key in removed {
            keys.remove(key);
        }
        keys.extend(added.iter().cloned());
    }
}

fn mark_complete(tree: &mut Tree<BTreeMap<QueryParams, TrackedQuery>>) {
    if let Some(queries) = tree.value_mut() {
        for tracked in queries.values_mut() {
            tracked.complete = true;
        }
    }
    for child in tree.children_mut().values_mut() {
        mark_complete(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limited(path: &str) -> QuerySpec {
        QuerySpec::with_params(
            Path::new(path),
            QueryParams::new().limit_to_first(2).unwrap(),
        )
    }

    #[test]
    fn noop_cache_is_empty_and_incomplete() {
        let cache = NoopPersistenceManager.server_cache(&QuerySpec::new(Path::new("a")));
        assert!(!cache.fully_initialized());
        assert_eq!(cache.variant(), &Value::Null);
        assert!(NoopPersistenceManager.load_user_writes().is_empty());
    }

    #[test]
    fn user_writes_load_in_id_order() {
        let persistence = InMemoryPersistenceManager::new();
        persistence.save_user_overwrite(&Path::new("b"), &json!(2), 2);
        persistence.save_user_merge(
            &Path::new("a"),
            &CompoundWrite::from_variant_merge(&json!({ "x": 1 })),
            1,
        );
        let ids: Vec<WriteId> = persistence
            .load_user_writes()
            .iter()
            .map(|record| record.write_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        persistence.remove_user_write(1);
        assert_eq!(persistence.load_user_writes().len(), 1);
        persistence.remove_all_user_writes();
        assert!(persistence.load_user_writes().is_empty());
    }

    #[test]
    fn complete_default_query_serves_full_cache() {
        let persistence = InMemoryPersistenceManager::new();
        let spec = QuerySpec::new(Path::new("a"));
        persistence.set_query_active(&spec);
        persistence.update_server_cache(ServerCacheUpdate::Overwrite(
            spec.clone(),
            json!({ "x": 1, "y": 2 }),
        ));
        assert!(!persistence.server_cache(&spec).fully_initialized());

        persistence.set_query_complete(&spec);
        let cache = persistence.server_cache(&spec);
        assert!(cache.fully_initialized());
        assert!(!cache.filtered());
        assert_eq!(cache.variant(), &json!({ "x": 1, "y": 2 }));

        let child = persistence.server_cache(&QuerySpec::new(Path::new("a/x")));
        assert!(child.fully_initialized());
        assert_eq!(child.variant(), &json!(1));
    }

    #[test]
    fn complete_filtered_query_is_limited_to_tracked_keys() {
        let persistence = InMemoryPersistenceManager::new();
        let spec = limited("list");
        persistence.set_query_active(&spec);
        persistence.update_server_cache(ServerCacheUpdate::Overwrite(
            spec.clone(),
            json!({ "a": 1, "b": 2 }),
        ));
        persistence.update_server_cache(ServerCacheUpdate::Merge(
            Path::new("list"),
            CompoundWrite::from_variant_merge(&json!({ "c": 3 })),
        ));
        persistence.set_tracked_query_keys(&spec, &BTreeSet::from(["a".to_string(), "b".to_string()]));
        persistence.set_query_complete(&spec);

        let cache = persistence.server_cache(&spec);
        assert!(cache.fully_initialized());
        assert!(cache.filtered());
        assert_eq!(cache.variant(), &json!({ "a": 1, "b": 2 }));

        persistence.update_tracked_query_keys(
            &spec,
            &BTreeSet::from(["c".to_string()]),
            &BTreeSet::from(["a".to_string()]),
        );
        assert_eq!(
            persistence.tracked_query_keys(&spec),
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn incomplete_default_query_serves_known_complete_children() {
        let persistence = InMemoryPersistenceManager::new();
        let child = QuerySpec::new(Path::new("a/x"));
        persistence.set_query_active(&child);
        persistence.update_server_cache(ServerCacheUpdate::Overwrite(child.clone(), json!(5)));
        persistence.set_query_complete(&child);
        persistence.update_server_cache(ServerCacheUpdate::Overwrite(
            QuerySpec::new(Path::new("a/y")),
            json!(6),
        ));

        let cache = persistence.server_cache(&QuerySpec::new(Path::new("a")));
        assert!(!cache.fully_initialized());
        assert_eq!(cache.variant(), &json!({ "x": 5 }));
    }

    #[test]
    fn user_write_skips_cache_under_active_default_query() {
        let persistence = InMemoryPersistenceManager::new();
        let spec = QuerySpec::new(Path::new("a"));
        persistence.set_query_active(&spec);
        persistence.apply_user_write_to_server_cache(
            &Path::new("a/b"),
            &UserWrite::Overwrite(json!(1)),
        );
        assert_eq!(persistence.server_cache_at(&Path::new("a/b")), Value::Null);

        persistence.set_query_inactive(&spec);
        persistence.apply_user_write_to_server_cache(
            &Path::new("a/b"),
            &UserWrite::Overwrite(json!(1)),
        );
        assert_eq!(persistence.server_cache_at(&Path::new("a/b")), json!(1));
        let tracked = persistence
            .tracked_query(&QuerySpec::new(Path::new("a/b")))
            .unwrap();
        assert!(tracked.complete);
        assert!(!tracked.active);
    }

    #[test]
    fn loads_all_data_queries_share_the_default_entry() {
        let persistence = InMemoryPersistenceManager::new();
        let ordered = QuerySpec::with_params(
            Path::new("a"),
            QueryParams::new().order_by_key().unwrap(),
        );
        persistence.set_query_active(&ordered);
        let tracked = persistence
            .tracked_query(&QuerySpec::new(Path::new("a")))
            .unwrap();
        assert!(tracked.active);
        assert!(tracked.query_spec.is_default());
    }
}
