//! Entry point reconciling local writes, server data and listeners.
//!
//! The [`SyncTree`] owns one [`SyncPoint`] per watched location, the log of
//! pending writes and the tags of filtered listens. Every mutating call
//! returns the [`Event`]s it produced; the caller fires them once the call
//! returned so listener code never runs while the tree is being updated.
//!
//! Listens follow a shadowing rule: a location covered by a complete
//! (unfiltered) view higher up does not get its own server listen, since the
//! ancestor's data already contains it.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::database::core::compound_write::CompoundWrite;
use crate::database::core::event_registration::{EventRegistration, ListenerId};
use crate::database::core::listen_provider::{ListenProvider, Tag};
use crate::database::core::operation::{AckStatus, Operation, OperationSource};
use crate::database::core::persistence::{PersistenceManager, ServerCacheUpdate};
use crate::database::core::sync_point::{RemovedRegistrations, SyncPoint};
use crate::database::core::tree::Tree;
use crate::database::core::write_tree::{
    HiddenWriteInclusion, OverwriteVisibility, UserWrite, WriteId, WriteTree, WriteTreeRef,
};
use crate::database::error::DatabaseError;
use crate::database::path::Path;
use crate::database::query::QuerySpec;
use crate::database::server_value::{
    generate_server_values, resolve_deferred_value_merge, resolve_deferred_value_snapshot,
};
use crate::database::variant::{
    children, get_internal_variant, get_immediate_child, normalize_arrays, update_immediate_child,
};
use crate::database::view::event::Event;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::database::view::view::View;
use crate::database::view::view_cache::CacheNode;
use crate::util::dev_assert;

#[derive(Clone, Debug, Default)]
pub struct SyncTreeConfig {
    /// Whether [`SyncTree::apply_user_set`] and [`SyncTree::apply_user_update`]
    /// save writes through the persistence manager.
    pub persist_user_writes: bool,
}

/// Queries that load all data listen as the default query of their location.
fn query_spec_for_listening(query_spec: &QuerySpec) -> QuerySpec {
    if query_spec.loads_all_data() && !query_spec.is_default() {
        query_spec.default_form()
    } else {
        query_spec.clone()
    }
}

fn normalize_path_merge(changed_children: &BTreeMap<Path, Value>) -> CompoundWrite {
    let normalized: BTreeMap<Path, Value> = changed_children
        .iter()
        .map(|(path, value)| (path.clone(), normalize_arrays(value.clone())))
        .collect();
    CompoundWrite::from_path_merge(&normalized)
}

pub struct SyncTree {
    config: SyncTreeConfig,
    pending_write_tree: WriteTree,
    sync_point_tree: Tree<SyncPoint>,
    persistence: Box<dyn PersistenceManager>,
    listen_provider: Box<dyn ListenProvider>,
    query_spec_to_tag: BTreeMap<QuerySpec, Tag>,
    tag_to_query_spec: BTreeMap<Tag, QuerySpec>,
    keep_synced_queries: BTreeSet<QuerySpec>,
    next_query_tag: u64,
    /// Identity of the keep-synced registrations this tree owns.
    listener_id: ListenerId,
}

impl std::fmt::Debug for SyncTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTree")
            .field("config", &self.config)
            .field("pending_writes", &self.pending_write_tree.all_writes().len())
            .field("tags", &self.tag_to_query_spec)
            .field("keep_synced_queries", &self.keep_synced_queries)
            .finish()
    }
}

impl SyncTree {
    pub fn new(
        persistence: Box<dyn PersistenceManager>,
        listen_provider: Box<dyn ListenProvider>,
    ) -> Self {
        Self::with_config(SyncTreeConfig::default(), persistence, listen_provider)
    }

    pub fn with_config(
        config: SyncTreeConfig,
        persistence: Box<dyn PersistenceManager>,
        listen_provider: Box<dyn ListenProvider>,
    ) -> Self {
        Self {
            config,
            pending_write_tree: WriteTree::new(),
            sync_point_tree: Tree::new(),
            persistence,
            listen_provider,
            query_spec_to_tag: BTreeMap::new(),
            tag_to_query_spec: BTreeMap::new(),
            keep_synced_queries: BTreeSet::new(),
            next_query_tag: 1,
            listener_id: ListenerId::next(),
        }
    }

    pub fn config(&self) -> &SyncTreeConfig {
        &self.config
    }

    /// No location is being watched.
    pub fn is_empty(&self) -> bool {
        self.sync_point_tree.is_empty()
    }

    pub fn pending_writes(&self) -> &WriteTree {
        &self.pending_write_tree
    }

    pub fn sync_point(&self, path: &Path) -> Option<&SyncPoint> {
        self.sync_point_tree.get_value_at(path)
    }

    fn run_in_transaction<T, F>(&mut self, body: F) -> T
    where
        F: FnOnce(&mut Self) -> T,
    {
        self.persistence.begin_transaction();
        let result = body(self);
        self.persistence.set_transaction_successful();
        self.persistence.end_transaction();
        result
    }

    /// Replays the writes the persistence manager kept from an earlier
    /// session. They are already saved, so they are not persisted again.
    pub fn restore_user_writes(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        for record in self.persistence.load_user_writes() {
            log::debug!("Restoring pending write {}", record.write_id);
            match record.write {
                UserWrite::Overwrite(data) => events.extend(self.apply_user_overwrite(
                    &record.path,
                    data,
                    record.write_id,
                    OverwriteVisibility::Visible,
                    false,
                )),
                UserWrite::Merge(merge) => events.extend(self.apply_user_merge(
                    &record.path,
                    merge,
                    record.write_id,
                    false,
                )),
            }
        }
        events
    }

    /// Records a local overwrite and, when visible, raises events for it.
    pub fn apply_user_overwrite(
        &mut self,
        path: &Path,
        new_data: Value,
        write_id: WriteId,
        visibility: OverwriteVisibility,
        persist: bool,
    ) -> Vec<Event> {
        dev_assert(
            visibility == OverwriteVisibility::Visible || !persist,
            "We shouldn't be persisting non-visible writes.",
        );
        let new_data = normalize_arrays(new_data);
        self.run_in_transaction(|tree| {
            if persist {
                tree.persistence
                    .save_user_overwrite(path, &new_data, write_id);
            }
            tree.pending_write_tree
                .add_overwrite(path, new_data.clone(), write_id, visibility);
            if visibility == OverwriteVisibility::Visible {
                tree.apply_operation_to_sync_points(&Operation::overwrite(
                    OperationSource::user(),
                    path.clone(),
                    new_data,
                ))
            } else {
                Vec::new()
            }
        })
    }

    /// Records a local merge and raises events for it.
    pub fn apply_user_merge(
        &mut self,
        path: &Path,
        changed_children: CompoundWrite,
        write_id: WriteId,
        persist: bool,
    ) -> Vec<Event> {
        self.run_in_transaction(|tree| {
            if persist {
                tree.persistence
                    .save_user_merge(path, &changed_children, write_id);
            }
            tree.pending_write_tree
                .add_merge(path, changed_children.clone(), write_id);
            tree.apply_operation_to_sync_points(&Operation::merge(
                OperationSource::user(),
                path.clone(),
                changed_children,
            ))
        })
    }

    /// Visible overwrite persisted according to the configuration.
    pub fn apply_user_set(&mut self, path: &Path, new_data: Value, write_id: WriteId) -> Vec<Event> {
        let persist = self.config.persist_user_writes;
        self.apply_user_overwrite(
            path,
            new_data,
            write_id,
            OverwriteVisibility::Visible,
            persist,
        )
    }

    /// Merge of `{"relative/path": value}` updates persisted according to
    /// the configuration.
    pub fn apply_user_update(
        &mut self,
        path: &Path,
        updates: &serde_json::Map<String, Value>,
        write_id: WriteId,
    ) -> Vec<Event> {
        let persist = self.config.persist_user_writes;
        let merge = CompoundWrite::from_child_merge(
            updates
                .iter()
                .map(|(key, value)| (key.clone(), normalize_arrays(value.clone())))
                .collect::<BTreeMap<String, Value>>()
                .iter(),
        );
        self.apply_user_merge(path, merge, write_id, persist)
    }

    /// Completes a pending write. An accepted visible write becomes server
    /// data, with its server values resolved using `server_time_offset_ms`.
    /// Events are raised only when dropping the write changes what views
    /// show.
    pub fn ack_user_write(
        &mut self,
        write_id: WriteId,
        revert: AckStatus,
        persist: bool,
        server_time_offset_ms: i64,
    ) -> Vec<Event> {
        self.run_in_transaction(|tree| {
            if persist {
                tree.persistence.remove_user_write(write_id);
            }
            let Some(write) = tree.pending_write_tree.get_write(write_id).cloned() else {
                log::warn!("Acknowledging unknown write {write_id}");
                return Vec::new();
            };
            let existing = tree
                .complete_server_cache_on_path(&write.path)
                .cloned()
                .unwrap_or(Value::Null);
            let need_to_reevaluate = tree.pending_write_tree.remove_write(write_id);
            log::debug!("Removed pending write {write_id} ({revert:?})");

            if write.visible && revert == AckStatus::Confirm {
                let server_values = generate_server_values(server_time_offset_ms);
                let resolved = match &write.write {
                    UserWrite::Overwrite(data) => UserWrite::Overwrite(
                        resolve_deferred_value_snapshot(data, &existing, &server_values),
                    ),
                    UserWrite::Merge(merge) => UserWrite::Merge(resolve_deferred_value_merge(
                        merge,
                        &existing,
                        &server_values,
                    )),
                };
                tree.persistence
                    .apply_user_write_to_server_cache(&write.path, &resolved);
            }

            if !need_to_reevaluate {
                return Vec::new();
            }
            let mut affected_tree = Tree::new();
            match &write.write {
                UserWrite::Overwrite(_) => affected_tree.set_value(Some(true)),
                UserWrite::Merge(merge) => {
                    merge.write_tree().call_on_each(&mut |relative, _| {
                        affected_tree.set_value_at(relative, Some(true));
                    });
                }
            }
            tree.apply_operation_to_sync_points(&Operation::ack_user_write(
                write.path,
                affected_tree,
                revert,
            ))
        })
    }

    /// Drops every pending write, reverting whatever views showed for them.
    pub fn remove_all_writes(&mut self) -> Vec<Event> {
        self.run_in_transaction(|tree| {
            tree.persistence.remove_all_user_writes();
            let purged = tree.pending_write_tree.purge_all_writes();
            if purged.is_empty() {
                return Vec::new();
            }
            log::debug!("Reverting {} pending writes", purged.len());
            tree.apply_operation_to_sync_points(&Operation::ack_user_write(
                Path::root(),
                Tree::with_value(Some(true)),
                AckStatus::Revert,
            ))
        })
    }

    pub fn apply_server_overwrite(&mut self, path: &Path, new_data: Value) -> Vec<Event> {
        let new_data = normalize_arrays(new_data);
        self.run_in_transaction(|tree| {
            tree.persistence.update_server_cache(ServerCacheUpdate::Overwrite(
                QuerySpec::new(path.clone()),
                new_data.clone(),
            ));
            tree.apply_operation_to_sync_points(&Operation::overwrite(
                OperationSource::server(),
                path.clone(),
                new_data,
            ))
        })
    }

    pub fn apply_server_merge(
        &mut self,
        path: &Path,
        changed_children: &BTreeMap<Path, Value>,
    ) -> Vec<Event> {
        let merge = normalize_path_merge(changed_children);
        self.run_in_transaction(|tree| {
            tree.persistence
                .update_server_cache(ServerCacheUpdate::Merge(path.clone(), merge.clone()));
            tree.apply_operation_to_sync_points(&Operation::merge(
                OperationSource::server(),
                path.clone(),
                merge,
            ))
        })
    }

    /// The server finished sending the initial data of the listen at `path`.
    pub fn apply_listen_complete(&mut self, path: &Path) -> Vec<Event> {
        self.run_in_transaction(|tree| {
            tree.persistence
                .set_query_complete(&QuerySpec::new(path.clone()));
            tree.apply_operation_to_sync_points(&Operation::listen_complete(
                OperationSource::server(),
                path.clone(),
            ))
        })
    }

    /// Server data for the filtered listen identified by `tag`. A tag whose
    /// query was already removed is ignored.
    pub fn apply_tagged_query_overwrite(
        &mut self,
        path: &Path,
        snap: Value,
        tag: Tag,
    ) -> Vec<Event> {
        let snap = normalize_arrays(snap);
        self.run_in_transaction(|tree| {
            let Some(query_spec) = tree.query_spec_for_tag(tag).cloned() else {
                log::debug!("Ignoring overwrite for removed query tag {tag}");
                return Vec::new();
            };
            let Some(relative_path) = Path::get_relative(&query_spec.path, path) else {
                dev_assert(false, "Tagged overwrite outside of its query");
                return Vec::new();
            };
            let query_to_overwrite = if relative_path.is_empty() {
                query_spec.clone()
            } else {
                QuerySpec::new(path.clone())
            };
            tree.persistence
                .update_server_cache(ServerCacheUpdate::Overwrite(query_to_overwrite, snap.clone()));
            let operation = Operation::overwrite(
                OperationSource::for_server_tagged_query(query_spec.params.clone()),
                relative_path,
                snap,
            );
            tree.apply_tagged_operation(&query_spec, &operation)
        })
    }

    pub fn apply_tagged_query_merge(
        &mut self,
        path: &Path,
        changed_children: &BTreeMap<Path, Value>,
        tag: Tag,
    ) -> Vec<Event> {
        let merge = normalize_path_merge(changed_children);
        self.run_in_transaction(|tree| {
            let Some(query_spec) = tree.query_spec_for_tag(tag).cloned() else {
                log::debug!("Ignoring merge for removed query tag {tag}");
                return Vec::new();
            };
            let Some(relative_path) = Path::get_relative(&query_spec.path, path) else {
                dev_assert(false, "Tagged merge outside of its query");
                return Vec::new();
            };
            tree.persistence
                .update_server_cache(ServerCacheUpdate::Merge(path.clone(), merge.clone()));
            let operation = Operation::merge(
                OperationSource::for_server_tagged_query(query_spec.params.clone()),
                relative_path,
                merge,
            );
            tree.apply_tagged_operation(&query_spec, &operation)
        })
    }

    pub fn apply_tagged_listen_complete(&mut self, tag: Tag) -> Vec<Event> {
        self.run_in_transaction(|tree| {
            let Some(query_spec) = tree.query_spec_for_tag(tag).cloned() else {
                log::debug!("Ignoring listen complete for removed query tag {tag}");
                return Vec::new();
            };
            tree.persistence.set_query_complete(&query_spec);
            let operation = Operation::listen_complete(
                OperationSource::for_server_tagged_query(query_spec.params.clone()),
                Path::root(),
            );
            tree.apply_tagged_operation(&query_spec, &operation)
        })
    }

    fn apply_tagged_operation(&mut self, query_spec: &QuerySpec, operation: &Operation) -> Vec<Event> {
        let Some(sync_point) = self
            .sync_point_tree
            .get_child_mut(&query_spec.path)
            .and_then(Tree::value_mut)
        else {
            dev_assert(false, "Missing sync point for query tag that we're tracking");
            return Vec::new();
        };
        let writes_cache = self.pending_write_tree.child_writes(&query_spec.path);
        sync_point.apply_operation(operation, &writes_cache, None, self.persistence.as_ref())
    }

    /// Registers a listener and returns the events that bring it up to date.
    /// A server listen is started unless an existing view already covers the
    /// query.
    pub fn add_event_registration(&mut self, registration: EventRegistration) -> Vec<Event> {
        self.run_in_transaction(|tree| tree.add_event_registration_in_transaction(registration))
    }

    fn add_event_registration_in_transaction(
        &mut self,
        registration: EventRegistration,
    ) -> Vec<Event> {
        let query_spec = registration.query_spec().clone();
        let path = &query_spec.path;
        let params = &query_spec.params;

        // Pending writes only matter once a view exists, so the walk only
        // looks for complete server data.
        let mut server_cache_variant: Option<Value> = None;
        let mut found_ancestor_default_view = false;
        {
            let directories = path.directories();
            let mut current = Some(&self.sync_point_tree);
            let mut depth = 0;
            while let Some(node) = current {
                if let Some(sync_point) = node.value() {
                    if server_cache_variant.is_none() {
                        let relative = Path::from_segments(directories[depth..].iter().cloned());
                        server_cache_variant = sync_point.complete_server_cache(&relative).cloned();
                    }
                    found_ancestor_default_view |= sync_point.has_complete_view();
                }
                let Some(key) = directories.get(depth) else {
                    break;
                };
                current = node.children().get(key);
                depth += 1;
            }
        }

        let node = self.sync_point_tree.get_or_make_subtree(path);
        if node.value().is_none() {
            node.set_value(Some(SyncPoint::new()));
        }

        self.persistence.set_query_active(&query_spec);

        let server_cache = match server_cache_variant {
            Some(variant) => CacheNode::new(IndexedVariant::with_params(variant, params.clone()), true, false),
            None => {
                let persisted = self.persistence.server_cache(&query_spec);
                if persisted.fully_initialized() {
                    persisted
                } else {
                    // Assemble what descendants and the cache know.
                    let mut variant = Value::Null;
                    if let Some(subtree) = self.sync_point_tree.get_child(path) {
                        for (key, child) in subtree.children() {
                            let complete = child
                                .value()
                                .and_then(|sync_point| sync_point.complete_server_cache(&Path::root()));
                            if let Some(complete) = complete {
                                update_immediate_child(&mut variant, key, complete.clone());
                            }
                        }
                    }
                    for (key, value) in children(persisted.variant()) {
                        if get_internal_variant(&variant, &Path::from_segments([key.as_str()])).is_none() {
                            update_immediate_child(&mut variant, key, value.clone());
                        }
                    }
                    CacheNode::new(IndexedVariant::with_params(variant, params.clone()), false, false)
                }
            }
        };

        let view_already_exists = self
            .sync_point_tree
            .get_value_at(path)
            .is_some_and(|sync_point| sync_point.view_exists_for_query(&query_spec));
        if !view_already_exists && !query_spec.loads_all_data() {
            dev_assert(
                !self.query_spec_to_tag.contains_key(&query_spec),
                "View does not exist but we have a tag",
            );
            let tag = Tag(self.next_query_tag);
            self.next_query_tag += 1;
            self.query_spec_to_tag.insert(query_spec.clone(), tag);
            self.tag_to_query_spec.insert(tag, query_spec.clone());
        }

        let Some(sync_point) = self
            .sync_point_tree
            .get_child_mut(path)
            .and_then(Tree::value_mut)
        else {
            return Vec::new();
        };
        let writes_cache = self.pending_write_tree.child_writes(path);
        let events = sync_point.add_event_registration(
            registration,
            &writes_cache,
            &server_cache,
            self.persistence.as_ref(),
        );

        if !view_already_exists && !found_ancestor_default_view {
            self.setup_listener(&query_spec);
        }
        events
    }

    /// Removes the registration of `listener`, or every registration of the
    /// query when `listener` is `None`. A default `query_spec` reaches every
    /// view at its location. With a `cancel_error`, the removed registrations
    /// come back as cancel events.
    pub fn remove_event_registration(
        &mut self,
        query_spec: &QuerySpec,
        listener: Option<ListenerId>,
        cancel_error: Option<&DatabaseError>,
    ) -> Vec<Event> {
        self.run_in_transaction(|tree| {
            tree.remove_event_registration_in_transaction(query_spec, listener, cancel_error)
        })
    }

    /// Cancels every registration of `query_spec` with `error`.
    pub fn remove_all_event_registrations(
        &mut self,
        query_spec: &QuerySpec,
        error: &DatabaseError,
    ) -> Vec<Event> {
        self.remove_event_registration(query_spec, None, Some(error))
    }

    fn remove_event_registration_in_transaction(
        &mut self,
        query_spec: &QuerySpec,
        listener: Option<ListenerId>,
        cancel_error: Option<&DatabaseError>,
    ) -> Vec<Event> {
        let path = &query_spec.path;
        let Some(sync_point) = self
            .sync_point_tree
            .get_child_mut(path)
            .and_then(Tree::value_mut)
        else {
            log::warn!("No listeners to remove for {query_spec}");
            return Vec::new();
        };
        // Removing through an indexed query that loads all data only affects
        // that query, so this checks for the default query specifically.
        if !query_spec.is_default() && !sync_point.view_exists_for_query(query_spec) {
            log::warn!("No listeners to remove for {query_spec}");
            return Vec::new();
        }

        let RemovedRegistrations {
            events,
            removed_queries: removed,
        } = sync_point.remove_event_registration(query_spec, listener, cancel_error);
        if sync_point.is_empty() {
            if let Some(node) = self.sync_point_tree.get_child_mut(path) {
                node.set_value(None);
                if node.is_empty() {
                    self.sync_point_tree.remove_subtree(path);
                }
            }
        }

        let mut removing_default = false;
        for removed_query in &removed {
            self.persistence.set_query_inactive(removed_query);
            removing_default |= removed_query.loads_all_data();
        }

        let covered = self.is_covered_by_complete_view(path);

        if removing_default && !covered {
            // Descendant listens were shadowed by the removed default listen
            // and have to be sent now.
            if let Some(subtree) = self.sync_point_tree.get_child(path) {
                let mut new_views = Vec::new();
                collect_distinct_views_for_subtree(subtree, &mut new_views);
                for view in new_views {
                    let new_query = view.query_spec();
                    let tag = self.tag_for_query_spec(new_query);
                    log::debug!("Starting listen for {new_query} after unshadowing");
                    self.listen_provider
                        .start_listening(&query_spec_for_listening(new_query), tag, view);
                }
            }
        }

        // A cancelled listen is already gone on the server side.
        if !covered && !removed.is_empty() && cancel_error.is_none() {
            if removing_default {
                log::debug!("Stopping listen for {query_spec}");
                self.listen_provider
                    .stop_listening(&query_spec_for_listening(query_spec), None);
            } else {
                for query_to_remove in &removed {
                    let tag = self.tag_for_query_spec(query_to_remove);
                    dev_assert(tag.is_some(), "Removed filtered query has no tag");
                    log::debug!("Stopping listen for {query_to_remove}");
                    self.listen_provider
                        .stop_listening(&query_spec_for_listening(query_to_remove), tag);
                }
            }
        }

        self.remove_tags(&removed);
        events
    }

    /// Whether a complete view exists at or above `path`.
    fn is_covered_by_complete_view(&self, path: &Path) -> bool {
        let has_complete_view =
            |node: &Tree<SyncPoint>| node.value().is_some_and(SyncPoint::has_complete_view);
        let mut current = &self.sync_point_tree;
        let mut covered = has_complete_view(current);
        for directory in path.directories() {
            if covered {
                break;
            }
            let Some(child) = current.children().get(directory) else {
                break;
            };
            current = child;
            covered = has_complete_view(current);
            if current.is_empty() {
                break;
            }
        }
        covered
    }

    fn remove_tags(&mut self, queries: &[QuerySpec]) {
        for removed_query in queries {
            if removed_query.loads_all_data() {
                continue;
            }
            match self.query_spec_to_tag.remove(removed_query) {
                Some(tag) => {
                    self.tag_to_query_spec.remove(&tag);
                }
                None => dev_assert(false, "Removed filtered query has no tag"),
            }
        }
    }

    fn setup_listener(&self, query_spec: &QuerySpec) {
        let tag = self.tag_for_query_spec(query_spec);
        let Some(subtree) = self.sync_point_tree.get_child(&query_spec.path) else {
            return;
        };
        let Some(sync_point) = subtree.value() else {
            return;
        };
        let Some(view) = sync_point.view_for_query(query_spec) else {
            return;
        };
        log::debug!("Starting listen for {query_spec}");
        self.listen_provider
            .start_listening(&query_spec_for_listening(query_spec), tag, view);

        if tag.is_some() {
            dev_assert(
                !sync_point.has_complete_view(),
                "If we're adding a query, it shouldn't be shadowed",
            );
            return;
        }
        // A default listen shadows every listen at or below its location.
        subtree.call_on_each(&mut |relative, child_sync_point: &SyncPoint| {
            if !relative.is_empty() && child_sync_point.has_complete_view() {
                if let Some(complete_view) = child_sync_point.complete_view() {
                    let shadowed = complete_view.query_spec();
                    self.listen_provider.stop_listening(
                        &query_spec_for_listening(shadowed),
                        self.tag_for_query_spec(shadowed),
                    );
                }
            } else {
                for view in child_sync_point.incomplete_query_views() {
                    let shadowed = view.query_spec();
                    self.listen_provider.stop_listening(
                        &query_spec_for_listening(shadowed),
                        self.tag_for_query_spec(shadowed),
                    );
                }
            }
        });
    }

    /// Keeps the data of `query_spec` cached without a listener. Repeated
    /// calls with the same flag do nothing.
    pub fn set_keep_synchronized(&mut self, query_spec: &QuerySpec, keep_synchronized: bool) {
        let contains = self.keep_synced_queries.contains(query_spec);
        if keep_synchronized && !contains {
            let registration = EventRegistration::keep_synced(query_spec.clone(), self.listener_id);
            self.add_event_registration(registration);
            self.keep_synced_queries.insert(query_spec.clone());
        } else if !keep_synchronized && contains {
            let listener_id = self.listener_id;
            self.remove_event_registration(query_spec, Some(listener_id), None);
            self.keep_synced_queries.remove(query_spec);
        }
    }

    pub fn is_keep_synchronized(&self, query_spec: &QuerySpec) -> bool {
        self.keep_synced_queries.contains(query_spec)
    }

    /// Effective data at `path`: the nearest complete server data with
    /// pending writes, hidden ones included, layered on top.
    pub fn calc_complete_event_cache(
        &self,
        path: &Path,
        write_ids_to_exclude: &[WriteId],
    ) -> Option<Value> {
        let server_cache = self.complete_server_cache_on_path(path);
        self.pending_write_tree.calc_complete_event_cache(
            path,
            server_cache,
            write_ids_to_exclude,
            HiddenWriteInclusion::Include,
        )
    }

    /// Complete server data for `path` from the shallowest sync point able
    /// to provide it.
    fn complete_server_cache_on_path(&self, path: &Path) -> Option<&Value> {
        let directories = path.directories();
        let mut current = &self.sync_point_tree;
        let mut depth = 0;
        loop {
            if let Some(sync_point) = current.value() {
                let relative = Path::from_segments(directories[depth..].iter().cloned());
                if let Some(cache) = sync_point.complete_server_cache(&relative) {
                    return Some(cache);
                }
            }
            let key = directories.get(depth)?;
            current = current.children().get(key)?;
            depth += 1;
        }
    }

    /// Data listeners of `query_spec` currently see, if the view has all of
    /// it.
    pub fn find_value(&self, query_spec: &QuerySpec) -> Option<&Value> {
        self.sync_point_tree
            .get_value_at(&query_spec.path)?
            .view_for_query(query_spec)?
            .view_cache()
            .complete_local_snap()
    }

    pub fn query_spec_for_tag(&self, tag: Tag) -> Option<&QuerySpec> {
        self.tag_to_query_spec.get(&tag)
    }

    pub fn tag_for_query_spec(&self, query_spec: &QuerySpec) -> Option<Tag> {
        self.query_spec_to_tag.get(query_spec).copied()
    }

    /// Fans `operation` out to every sync point it reaches, deeper locations
    /// first.
    fn apply_operation_to_sync_points(&mut self, operation: &Operation) -> Vec<Event> {
        let writes_cache = self.pending_write_tree.child_writes(&Path::root());
        apply_operation_helper(
            operation,
            &mut self.sync_point_tree,
            None,
            &writes_cache,
            self.persistence.as_ref(),
        )
    }
}

fn apply_operation_helper(
    operation: &Operation,
    sync_point_tree: &mut Tree<SyncPoint>,
    server_cache: Option<Value>,
    writes_cache: &WriteTreeRef<'_>,
    persistence: &dyn PersistenceManager,
) -> Vec<Event> {
    let Some(child_key) = operation.path.front_directory().map(str::to_string) else {
        return apply_operation_descendants_helper(
            operation,
            sync_point_tree,
            server_cache,
            writes_cache,
            persistence,
        );
    };

    let server_cache = server_cache.or_else(|| {
        sync_point_tree
            .value()
            .and_then(|sync_point| sync_point.complete_server_cache(&Path::root()))
            .cloned()
    });

    let mut events = Vec::new();
    if let Some(child_operation) = operation.for_child(&child_key) {
        if let Some(child_tree) = sync_point_tree.children_mut().get_mut(&child_key) {
            let child_server_cache = server_cache
                .as_ref()
                .map(|cache| get_immediate_child(cache, &child_key).clone());
            events = apply_operation_helper(
                &child_operation,
                child_tree,
                child_server_cache,
                &writes_cache.child(&child_key),
                persistence,
            );
        }
    }

    if let Some(sync_point) = sync_point_tree.value_mut() {
        events.extend(sync_point.apply_operation(
            operation,
            writes_cache,
            server_cache.as_ref(),
            persistence,
        ));
    }
    events
}

fn apply_operation_descendants_helper(
    operation: &Operation,
    sync_point_tree: &mut Tree<SyncPoint>,
    server_cache: Option<Value>,
    writes_cache: &WriteTreeRef<'_>,
    persistence: &dyn PersistenceManager,
) -> Vec<Event> {
    let server_cache = server_cache.or_else(|| {
        sync_point_tree
            .value()
            .and_then(|sync_point| sync_point.complete_server_cache(&Path::root()))
            .cloned()
    });

    let mut events = Vec::new();
    for (key, child_tree) in sync_point_tree.children_mut() {
        let child_server_cache = server_cache
            .as_ref()
            .map(|cache| get_immediate_child(cache, key).clone());
        if let Some(child_operation) = operation.for_child(key) {
            events.extend(apply_operation_descendants_helper(
                &child_operation,
                child_tree,
                child_server_cache,
                &writes_cache.child(key),
                persistence,
            ));
        }
    }

    if let Some(sync_point) = sync_point_tree.value_mut() {
        events.extend(sync_point.apply_operation(
            operation,
            writes_cache,
            server_cache.as_ref(),
            persistence,
        ));
    }
    events
}

/// Views that need their own listen once nothing above `subtree` covers it:
/// a complete view where one exists, otherwise every filtered view plus
/// whatever the children need.
fn collect_distinct_views_for_subtree<'a>(subtree: &'a Tree<SyncPoint>, views: &mut Vec<&'a View>) {
    if let Some(complete_view) = subtree.value().and_then(SyncPoint::complete_view) {
        views.push(complete_view);
        return;
    }
    if let Some(sync_point) = subtree.value() {
        views.extend(sync_point.incomplete_query_views());
    }
    for child in subtree.children().values() {
        collect_distinct_views_for_subtree(child, views);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::event_registration::ValueListener;
    use crate::database::core::persistence::{InMemoryPersistenceManager, NoopPersistenceManager};
    use crate::database::core::listen_provider::NoopListenProvider;
    use crate::database::query::QueryParams;
    use crate::database::snapshot::DataSnapshot;
    use crate::database::view::change::EventType;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingListenProvider {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl ListenProvider for RecordingListenProvider {
        fn start_listening(&self, query_spec: &QuerySpec, tag: Option<Tag>, _view: &View) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("start {query_spec} {tag:?}"));
        }

        fn stop_listening(&self, query_spec: &QuerySpec, tag: Option<Tag>) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("stop {query_spec} {tag:?}"));
        }
    }

    struct Silent;

    impl ValueListener for Silent {
        fn on_value_changed(&self, _snapshot: &DataSnapshot) {}
        fn on_cancelled(&self, _error: &DatabaseError) {}
    }

    fn value_registration(spec: &QuerySpec) -> EventRegistration {
        EventRegistration::value(spec.clone(), ListenerId::next(), Arc::new(Silent))
    }

    fn limited(path: &str) -> QuerySpec {
        QuerySpec::with_params(
            Path::new(path),
            QueryParams::new().limit_to_first(1).unwrap(),
        )
    }

    fn tree_with_provider() -> (SyncTree, RecordingListenProvider) {
        let provider = RecordingListenProvider::default();
        let tree = SyncTree::new(Box::new(NoopPersistenceManager), Box::new(provider.clone()));
        (tree, provider)
    }

    #[test]
    fn filtered_queries_get_tags() {
        let (mut tree, provider) = tree_with_provider();
        let spec = limited("a");
        tree.add_event_registration(value_registration(&spec));
        let tag = tree.tag_for_query_spec(&spec).unwrap();
        assert_eq!(tag, Tag(1));
        assert_eq!(tree.query_spec_for_tag(tag), Some(&spec));
        assert_eq!(provider.calls.lock().unwrap().len(), 1);

        tree.remove_event_registration(&spec, None, None);
        assert_eq!(tree.tag_for_query_spec(&spec), None);
        assert_eq!(tree.query_spec_for_tag(tag), None);
        assert!(tree.is_empty());
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn tagged_data_for_removed_query_is_ignored() {
        let (mut tree, _provider) = tree_with_provider();
        assert!(tree
            .apply_tagged_query_overwrite(&Path::new("a"), json!(1), Tag(7))
            .is_empty());
        assert!(tree.apply_tagged_listen_complete(Tag(7)).is_empty());
    }

    #[test]
    fn tagged_overwrite_reaches_its_view() {
        let (mut tree, _provider) = tree_with_provider();
        let spec = limited("list");
        tree.add_event_registration(value_registration(&spec));
        let tag = tree.tag_for_query_spec(&spec).unwrap();
        let events = tree.apply_tagged_query_overwrite(&Path::new("list"), json!({ "a": 1 }), tag);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Value);
        assert_eq!(tree.find_value(&spec), Some(&json!({ "a": 1 })));
    }

    fn value_events(events: &[Event]) -> Vec<Value> {
        events
            .iter()
            .filter(|event| event.event_type == EventType::Value)
            .filter_map(|event| event.snapshot().map(|snapshot| snapshot.value().clone()))
            .collect()
    }

    #[test]
    fn tagged_listen_complete_and_merge_keep_limited_window() {
        let persistence = InMemoryPersistenceManager::new();
        let mut tree = SyncTree::new(Box::new(persistence.clone()), Box::new(NoopListenProvider));
        let spec = QuerySpec::with_params(
            Path::new("scores"),
            QueryParams::new()
                .order_by_value()
                .and_then(|params| params.limit_to_first(2))
                .unwrap(),
        );
        tree.add_event_registration(value_registration(&spec));
        let tag = tree.tag_for_query_spec(&spec).unwrap();

        let events = tree.apply_tagged_listen_complete(tag);
        assert_eq!(value_events(&events), vec![Value::Null]);
        assert!(persistence.tracked_query(&spec).is_some_and(|query| query.complete));

        let events =
            tree.apply_tagged_query_overwrite(&Path::new("scores"), json!({ "a": 1, "b": 2 }), tag);
        assert_eq!(value_events(&events), vec![json!({ "a": 1, "b": 2 })]);

        let merge = BTreeMap::from([(Path::new("a"), json!(5)), (Path::new("c"), json!(0))]);
        let events = tree.apply_tagged_query_merge(&Path::new("scores"), &merge, tag);
        assert_eq!(value_events(&events), vec![json!({ "b": 2, "c": 0 })]);
        assert_eq!(tree.find_value(&spec), Some(&json!({ "b": 2, "c": 0 })));
        assert_eq!(
            persistence.tracked_query_keys(&spec),
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn removing_default_listener_unshadows_descendants() {
        let (mut tree, provider) = tree_with_provider();
        let parent = QuerySpec::new(Path::new("a"));
        let child = limited("a/b");
        tree.add_event_registration(value_registration(&parent));
        tree.add_event_registration(value_registration(&child));
        assert_eq!(
            *provider.calls.lock().unwrap(),
            vec!["start /a None".to_string()]
        );

        tree.remove_event_registration(&parent, None, None);
        let calls = provider.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].starts_with("start /a/b?"));
        assert!(calls[1].ends_with("Some(Tag(1))"));
        assert_eq!(calls[2], "stop /a None");
    }

    #[test]
    fn keep_synchronized_is_idempotent() {
        let (mut tree, provider) = tree_with_provider();
        let spec = QuerySpec::new(Path::new("k"));
        tree.set_keep_synchronized(&spec, true);
        tree.set_keep_synchronized(&spec, true);
        assert!(tree.is_keep_synchronized(&spec));
        assert_eq!(provider.calls.lock().unwrap().len(), 1);

        tree.set_keep_synchronized(&spec, false);
        tree.set_keep_synchronized(&spec, false);
        assert!(!tree.is_keep_synchronized(&spec));
        assert!(tree.is_empty());
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn calc_complete_event_cache_layers_writes() {
        let (mut tree, _provider) = tree_with_provider();
        let spec = QuerySpec::new(Path::new("a"));
        tree.add_event_registration(value_registration(&spec));
        tree.apply_server_overwrite(&Path::new("a"), json!({ "x": 1, "y": 2 }));
        tree.apply_user_overwrite(
            &Path::new("a/x"),
            json!(10),
            1,
            OverwriteVisibility::Invisible,
            false,
        );
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("a"), &[]),
            Some(json!({ "x": 10, "y": 2 }))
        );
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("a"), &[1]),
            Some(json!({ "x": 1, "y": 2 }))
        );
        // Hidden writes are included, so the write tree always answers, even
        // without server data.
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("elsewhere"), &[]),
            Some(Value::Null)
        );
    }

    #[test]
    fn restore_replays_persisted_writes() {
        let persistence = InMemoryPersistenceManager::new();
        persistence.save_user_overwrite(&Path::new("a"), &json!(5), 1);
        let mut tree = SyncTree::new(Box::new(persistence.clone()), Box::new(NoopListenProvider));
        tree.restore_user_writes();
        assert_eq!(tree.pending_writes().all_writes().len(), 1);
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("a"), &[]),
            Some(json!(5))
        );
    }

    #[test]
    fn confirmed_write_is_cached_as_server_data() {
        let persistence = InMemoryPersistenceManager::new();
        let mut tree = SyncTree::with_config(
            SyncTreeConfig {
                persist_user_writes: true,
            },
            Box::new(persistence.clone()),
            Box::new(NoopListenProvider),
        );
        tree.apply_user_set(&Path::new("t"), json!({ "at": { ".sv": "timestamp" } }), 1);
        assert_eq!(persistence.load_user_writes().len(), 1);

        tree.ack_user_write(1, AckStatus::Confirm, true, 0);
        assert!(persistence.load_user_writes().is_empty());
        assert!(persistence.server_cache_at(&Path::new("t/at")).is_i64());
    }
}
