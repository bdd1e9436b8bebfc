//! Folds one [`Operation`] into a [`ViewCache`].
//!
//! The server half of the cache only ever holds data the server sent; the
//! local half is the server data with pending writes layered on top and is
//! what listeners observe. Every transition reports the child changes it
//! caused, plus a value change when the observable data moved.

use serde_json::Value;

use crate::database::comparator::Post;
use crate::database::core::compound_write::CompoundWrite;
use crate::database::core::operation::{AckStatus, Operation, OperationKind};
use crate::database::core::tree::Tree;
use crate::database::core::write_tree::{IterationDirection, WriteTreeRef};
use crate::database::path::Path;
use crate::database::query::QueryParams;
use crate::database::variant::{
    children, get_child, get_immediate_child, get_priority, is_empty, is_leaf, is_priority_key,
    update_child, variants_are_equivalent,
};
use crate::database::view::change::Change;
use crate::database::view::child_change_accumulator::ChildChangeAccumulator;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::database::view::variant_filter::{CompleteChildSource, NoCompleteSource, VariantFilter};
use crate::database::view::view_cache::{CacheNode, ViewCache};
use crate::util::dev_assert;

/// Resolves children from the local cache, then from the complete server
/// data with pending writes applied.
struct WriteTreeCompleteChildSource<'a> {
    writes: &'a WriteTreeRef<'a>,
    view_cache: &'a ViewCache,
    opt_complete_server_cache: Option<&'a Value>,
}

impl<'a> WriteTreeCompleteChildSource<'a> {
    fn new(
        writes: &'a WriteTreeRef<'a>,
        view_cache: &'a ViewCache,
        opt_complete_server_cache: Option<&'a Value>,
    ) -> Self {
        Self {
            writes,
            view_cache,
            opt_complete_server_cache,
        }
    }
}

impl CompleteChildSource for WriteTreeCompleteChildSource<'_> {
    fn complete_child(&self, key: &str) -> Option<Value> {
        let local = self.view_cache.local_snap();
        if local.is_complete_for_child(key) {
            return Some(get_immediate_child(local.variant(), key).clone());
        }
        match self.opt_complete_server_cache {
            Some(server_cache) => {
                let server_node = CacheNode::new(IndexedVariant::new(server_cache.clone()), true, false);
                self.writes.calc_complete_child(key, &server_node)
            }
            None => self
                .writes
                .calc_complete_child(key, self.view_cache.server_snap()),
        }
    }

    fn child_after_child(
        &self,
        params: &QueryParams,
        child: &(String, Value),
        direction: IterationDirection,
    ) -> Option<(String, Value)> {
        let complete_server_data = self
            .opt_complete_server_cache
            .or_else(|| self.view_cache.complete_server_snap());
        self.writes.calc_next_variant_after_post(
            complete_server_data,
            &Post::node(child.0.clone(), child.1.clone()),
            direction,
            params,
        )
    }
}

#[derive(Debug)]
pub struct ViewProcessor {
    filter: Box<dyn VariantFilter>,
}

impl ViewProcessor {
    pub fn new(filter: Box<dyn VariantFilter>) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &dyn VariantFilter {
        self.filter.as_ref()
    }

    fn index(&self, variant: Value) -> IndexedVariant {
        IndexedVariant::with_params(variant, self.filter.query_params().clone())
    }

    /// Returns the new cache and the changes listeners should see.
    pub fn apply_operation(
        &self,
        old_view_cache: &ViewCache,
        operation: &Operation,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_cache: Option<&Value>,
    ) -> (ViewCache, Vec<Change>) {
        let mut accumulator = ChildChangeAccumulator::new();
        let path = &operation.path;
        let source = &operation.source;
        let new_view_cache = match &operation.kind {
            OperationKind::Overwrite { snap } if source.is_from_user() => self.apply_user_overwrite(
                old_view_cache,
                path,
                snap,
                writes_cache,
                opt_complete_cache,
                &mut accumulator,
            ),
            OperationKind::Overwrite { snap } => {
                // A tagged update is already filtered; an untagged one below
                // the root keeps whatever filtering the server cache has.
                let filter_server_node = source.tagged
                    || (old_view_cache.server_snap().filtered() && !path.is_empty());
                self.apply_server_overwrite(
                    old_view_cache,
                    path,
                    snap,
                    writes_cache,
                    opt_complete_cache,
                    filter_server_node,
                    &mut accumulator,
                )
            }
            OperationKind::Merge { children } if source.is_from_user() => self.apply_user_merge(
                old_view_cache,
                path,
                children,
                writes_cache,
                opt_complete_cache,
                &mut accumulator,
            ),
            OperationKind::Merge { children } => {
                let filter_server_node =
                    source.tagged || old_view_cache.server_snap().filtered();
                self.apply_server_merge(
                    old_view_cache,
                    path,
                    children,
                    writes_cache,
                    opt_complete_cache,
                    filter_server_node,
                    &mut accumulator,
                )
            }
            OperationKind::AckUserWrite {
                affected_tree,
                revert: AckStatus::Confirm,
            } => self.ack_user_write(
                old_view_cache,
                path,
                affected_tree,
                writes_cache,
                opt_complete_cache,
                &mut accumulator,
            ),
            OperationKind::AckUserWrite {
                revert: AckStatus::Revert,
                ..
            } => self.revert_user_write(
                old_view_cache,
                path,
                writes_cache,
                opt_complete_cache,
                &mut accumulator,
            ),
            OperationKind::ListenComplete => {
                self.listen_complete(old_view_cache, path, writes_cache, &mut accumulator)
            }
        };
        let mut changes = accumulator.into_changes();
        Self::maybe_add_value_event(old_view_cache, &new_view_cache, &mut changes);
        (new_view_cache, changes)
    }

    fn maybe_add_value_event(
        old_view_cache: &ViewCache,
        new_view_cache: &ViewCache,
        changes: &mut Vec<Change>,
    ) {
        let local_snap = new_view_cache.local_snap();
        if !local_snap.fully_initialized() {
            return;
        }
        let old_local_snap = old_view_cache.local_snap();
        let is_leaf_or_empty = is_leaf(local_snap.variant()) || is_empty(local_snap.variant());
        if !changes.is_empty()
            || !old_local_snap.fully_initialized()
            || (is_leaf_or_empty && local_snap.variant() != old_local_snap.variant())
            || !variants_are_equivalent(
                get_priority(local_snap.variant()),
                get_priority(old_local_snap.variant()),
            )
        {
            changes.push(Change::value(local_snap.variant().clone()));
        }
    }

    fn revert_user_write(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_server_cache: Option<&Value>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes_cache.shadowing_write(path).is_some() {
            return view_cache.clone();
        }
        let source =
            WriteTreeCompleteChildSource::new(writes_cache, view_cache, opt_complete_server_cache);
        let old_event_cache = view_cache.local_snap().indexed_variant();
        let server_snap = view_cache.server_snap();

        let new_local_cache = match path.front_directory() {
            Some(child_key) if !is_priority_key(child_key) => {
                let child_path = path.pop_front_directory();
                let mut new_child = writes_cache.calc_complete_child(child_key, server_snap);
                if new_child.is_none() && server_snap.is_complete_for_child(child_key) {
                    new_child = old_event_cache.child(child_key).cloned();
                }
                let updated = match new_child {
                    Some(child) => self.filter.update_child(
                        old_event_cache,
                        child_key,
                        child,
                        &child_path,
                        &source,
                        Some(&mut *accumulator),
                    ),
                    None if view_cache.local_snap().indexed_variant().has_child(child_key) => {
                        self.filter.update_child(
                            old_event_cache,
                            child_key,
                            Value::Null,
                            &child_path,
                            &source,
                            Some(&mut *accumulator),
                        )
                    }
                    None => old_event_cache.clone(),
                };
                if updated.variant().is_null() && server_snap.fully_initialized() {
                    // Every child write may have been reverted while the
                    // underlying data is a leaf.
                    match writes_cache.calc_complete_event_cache(view_cache.complete_server_snap()) {
                        Some(complete) if is_leaf(&complete) && !complete.is_null() => self
                            .filter
                            .update_full_variant(&updated, self.index(complete), Some(accumulator)),
                        _ => updated,
                    }
                } else {
                    updated
                }
            }
            _ => {
                let new_node = if server_snap.fully_initialized() {
                    writes_cache.calc_complete_event_cache(view_cache.complete_server_snap())
                } else {
                    Some(writes_cache.calc_complete_event_children(server_snap.variant()))
                };
                self.filter.update_full_variant(
                    old_event_cache,
                    self.index(new_node.unwrap_or(Value::Null)),
                    Some(accumulator),
                )
            }
        };

        let complete = server_snap.fully_initialized()
            || writes_cache.shadowing_write(&Path::root()).is_some();
        view_cache.update_local_snap(new_local_cache, complete, self.filter.filters_variants())
    }

    fn generate_event_cache_after_server_event(
        &self,
        view_cache: &ViewCache,
        change_path: &Path,
        writes_cache: &WriteTreeRef<'_>,
        source: &dyn CompleteChildSource,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes_cache.shadowing_write(change_path).is_some() {
            return view_cache.clone();
        }
        let old_local_snap = view_cache.local_snap();
        let server_snap = view_cache.server_snap();

        let new_local_cache = match change_path.front_directory() {
            None => {
                dev_assert(
                    server_snap.fully_initialized(),
                    "If change path is empty, we must have complete server data",
                );
                let node_with_local_writes = if server_snap.filtered() {
                    // Filtered server data cannot vouch for deep writes, so
                    // only complete children get local writes applied.
                    let complete_children = match view_cache.complete_server_snap() {
                        Some(server_cache) if !is_leaf(server_cache) => server_cache.clone(),
                        _ => Value::Null,
                    };
                    Some(writes_cache.calc_complete_event_children(&complete_children))
                } else {
                    writes_cache.calc_complete_event_cache(view_cache.complete_server_snap())
                };
                dev_assert(
                    node_with_local_writes.is_some(),
                    "Complete server data must produce a complete event cache",
                );
                self.filter.update_full_variant(
                    old_local_snap.indexed_variant(),
                    self.index(node_with_local_writes.unwrap_or(Value::Null)),
                    Some(accumulator),
                )
            }
            Some(child_key) if is_priority_key(child_key) => {
                dev_assert(
                    change_path.len() == 1,
                    "Can't have a priority with additional path components",
                );
                let updated_priority = writes_cache.calc_event_cache_after_server_overwrite(
                    change_path,
                    Some(old_local_snap.variant()),
                    Some(server_snap.variant()),
                );
                match updated_priority {
                    Some(priority) => self
                        .filter
                        .update_priority(old_local_snap.indexed_variant(), &priority),
                    None => old_local_snap.indexed_variant().clone(),
                }
            }
            Some(child_key) => {
                let child_change_path = change_path.pop_front_directory();
                let new_local_child = if old_local_snap.is_complete_for_child(child_key) {
                    let mut child = get_immediate_child(old_local_snap.variant(), child_key).clone();
                    let local_child_update = writes_cache.calc_event_cache_after_server_overwrite(
                        change_path,
                        Some(old_local_snap.variant()),
                        Some(server_snap.variant()),
                    );
                    if let Some(update) = local_child_update {
                        update_child(&mut child, &child_change_path, update);
                    }
                    Some(child)
                } else {
                    writes_cache.calc_complete_child(child_key, server_snap)
                };
                match new_local_child {
                    Some(child) => self.filter.update_child(
                        old_local_snap.indexed_variant(),
                        child_key,
                        child,
                        &child_change_path,
                        source,
                        Some(accumulator),
                    ),
                    None => old_local_snap.indexed_variant().clone(),
                }
            }
        };
        view_cache.update_local_snap(
            new_local_cache,
            old_local_snap.fully_initialized() || change_path.is_empty(),
            self.filter.filters_variants(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_server_overwrite(
        &self,
        old_view_cache: &ViewCache,
        change_path: &Path,
        changed_snap: &Value,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_cache: Option<&Value>,
        filter_server_node: bool,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_server_snap = old_view_cache.server_snap();
        let server_filter: &dyn VariantFilter = if filter_server_node {
            self.filter.as_ref()
        } else {
            self.filter.indexed_filter()
        };

        let new_server_cache = match change_path.front_directory() {
            None => server_filter.update_full_variant(
                old_server_snap.indexed_variant(),
                IndexedVariant::with_params(
                    changed_snap.clone(),
                    server_filter.query_params().clone(),
                ),
                None,
            ),
            Some(child_key) if server_filter.filters_variants() && !old_server_snap.filtered() => {
                // The server data was never filtered; filter it in full now.
                let mut new_child = get_immediate_child(old_server_snap.variant(), child_key).clone();
                update_child(
                    &mut new_child,
                    &change_path.pop_front_directory(),
                    changed_snap.clone(),
                );
                let new_server_node = old_server_snap
                    .indexed_variant()
                    .update_child(child_key, new_child);
                server_filter.update_full_variant(
                    old_server_snap.indexed_variant(),
                    new_server_node,
                    None,
                )
            }
            Some(child_key) => {
                if !old_server_snap.is_complete_for_path(change_path) && change_path.len() > 1 {
                    // Deep updates for incomplete children belong to other
                    // listens.
                    return old_view_cache.clone();
                }
                let child_change_path = change_path.pop_front_directory();
                let mut new_child = get_immediate_child(old_server_snap.variant(), child_key).clone();
                update_child(&mut new_child, &child_change_path, changed_snap.clone());
                if is_priority_key(child_key) {
                    server_filter.update_priority(old_server_snap.indexed_variant(), &new_child)
                } else {
                    server_filter.update_child(
                        old_server_snap.indexed_variant(),
                        child_key,
                        new_child,
                        &child_change_path,
                        &NoCompleteSource,
                        None,
                    )
                }
            }
        };

        let new_view_cache = old_view_cache.update_server_snap(
            new_server_cache,
            old_server_snap.fully_initialized() || change_path.is_empty(),
            server_filter.filters_variants(),
        );
        let source =
            WriteTreeCompleteChildSource::new(writes_cache, &new_view_cache, opt_complete_cache);
        self.generate_event_cache_after_server_event(
            &new_view_cache,
            change_path,
            writes_cache,
            &source,
            accumulator,
        )
    }

    fn apply_user_overwrite(
        &self,
        old_view_cache: &ViewCache,
        change_path: &Path,
        changed_snap: &Value,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_cache: Option<&Value>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_local_snap = old_view_cache.local_snap();
        let source =
            WriteTreeCompleteChildSource::new(writes_cache, old_view_cache, opt_complete_cache);

        let Some(child_key) = change_path.front_directory() else {
            let new_local_cache = self.filter.update_full_variant(
                old_local_snap.indexed_variant(),
                self.index(changed_snap.clone()),
                Some(accumulator),
            );
            return old_view_cache.update_local_snap(
                new_local_cache,
                true,
                self.filter.filters_variants(),
            );
        };

        if is_priority_key(child_key) {
            let new_local_cache = self
                .filter
                .update_priority(old_local_snap.indexed_variant(), changed_snap);
            return old_view_cache.update_local_snap(
                new_local_cache,
                old_local_snap.fully_initialized(),
                old_local_snap.filtered(),
            );
        }

        let child_change_path = change_path.pop_front_directory();
        let old_child = get_immediate_child(old_local_snap.variant(), child_key);
        let new_child = if child_change_path.is_empty() {
            changed_snap.clone()
        } else {
            match source.complete_child(child_key) {
                // A priority on a node that does not exist yet arrives with
                // the server's own update of that node.
                Some(child_node)
                    if child_change_path.back().is_some_and(is_priority_key)
                        && is_empty(get_child(&child_node, &child_change_path.parent())) =>
                {
                    child_node
                }
                Some(mut child_node) => {
                    update_child(&mut child_node, &child_change_path, changed_snap.clone());
                    child_node
                }
                None => Value::Null,
            }
        };

        if variants_are_equivalent(old_child, &new_child) {
            return old_view_cache.clone();
        }
        let new_local_snap = self.filter.update_child(
            old_local_snap.indexed_variant(),
            child_key,
            new_child,
            &child_change_path,
            &source,
            Some(accumulator),
        );
        old_view_cache.update_local_snap(
            new_local_snap,
            old_local_snap.fully_initialized(),
            self.filter.filters_variants(),
        )
    }

    /// Applies children the view already shows before new ones, so a limit
    /// window makes room before it fills up again.
    fn apply_user_merge(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        changed_children: &CompoundWrite,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_cache: Option<&Value>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        dev_assert(
            changed_children.root_write().is_none(),
            "Can't have a merge that is an overwrite",
        );
        let cache_has_child = |write_path: &Path| {
            write_path
                .front_directory()
                .is_some_and(|key| view_cache.local_snap().is_complete_for_child(key))
        };
        let mut current = view_cache.clone();
        for existing_children_pass in [true, false] {
            current = changed_children.write_tree().fold(
                current,
                &mut |child_path: &Path, value: &Value, current: ViewCache| {
                    let write_path = path.child_path(child_path);
                    if cache_has_child(&write_path) == existing_children_pass {
                        self.apply_user_overwrite(
                            &current,
                            &write_path,
                            value,
                            writes_cache,
                            opt_complete_cache,
                            accumulator,
                        )
                    } else {
                        current
                    }
                },
            );
        }
        current
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_server_merge(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        changed_children: &CompoundWrite,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_cache: Option<&Value>,
        filter_server_node: bool,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let server_snap = view_cache.server_snap();
        // Without any server data this merge was meant for an earlier listen
        // at this location; the complete data will follow.
        if is_empty(server_snap.variant()) && !server_snap.fully_initialized() {
            return view_cache.clone();
        }
        dev_assert(
            changed_children.root_write().is_none(),
            "Can't have a merge that is an overwrite",
        );
        let actual_merge = if path.is_empty() {
            changed_children.clone()
        } else {
            CompoundWrite::new().add_writes(path, changed_children)
        };
        let child_writes = actual_merge.child_compound_writes();
        let server_node = server_snap.indexed_variant();

        let mut current = view_cache.clone();
        for (child_key, child_write) in &child_writes {
            if let Some(server_child) = server_node.child(child_key) {
                let new_child = child_write.apply(server_child);
                current = self.apply_server_overwrite(
                    &current,
                    &Path::from_segments([child_key.as_str()]),
                    &new_child,
                    writes_cache,
                    opt_complete_cache,
                    filter_server_node,
                    accumulator,
                );
            }
        }
        for (child_key, child_write) in &child_writes {
            let is_unknown_deep_merge = !server_snap.is_complete_for_child(child_key)
                && child_write.root_write().is_none();
            if !server_node.has_child(child_key) && !is_unknown_deep_merge {
                let new_child = child_write.apply(&Value::Null);
                current = self.apply_server_overwrite(
                    &current,
                    &Path::from_segments([child_key.as_str()]),
                    &new_child,
                    writes_cache,
                    opt_complete_cache,
                    filter_server_node,
                    accumulator,
                );
            }
        }
        current
    }

    /// Re-applies the server data under the acknowledged write, which is no
    /// longer shadowed.
    fn ack_user_write(
        &self,
        view_cache: &ViewCache,
        ack_path: &Path,
        affected_tree: &Tree<bool>,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_cache: Option<&Value>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes_cache.shadowing_write(ack_path).is_some() {
            return view_cache.clone();
        }
        let filter_server_node = view_cache.server_snap().filtered();
        let server_cache = view_cache.server_snap();

        if affected_tree.value().is_some() {
            if (ack_path.is_empty() && server_cache.fully_initialized())
                || server_cache.is_complete_for_path(ack_path)
            {
                let variant = get_child(server_cache.variant(), ack_path).clone();
                return self.apply_server_overwrite(
                    view_cache,
                    ack_path,
                    &variant,
                    writes_cache,
                    opt_complete_cache,
                    filter_server_node,
                    accumulator,
                );
            }
            if ack_path.is_empty() {
                // Acking at this location without full data: replay what
                // the cache has as a merge.
                let mut changed_children = CompoundWrite::new();
                for (key, value) in children(server_cache.variant()) {
                    changed_children
                        .add_write_inline(&Path::from_segments([key.as_str()]), value.clone());
                }
                return self.apply_server_merge(
                    view_cache,
                    ack_path,
                    &changed_children,
                    writes_cache,
                    opt_complete_cache,
                    filter_server_node,
                    accumulator,
                );
            }
            return view_cache.clone();
        }

        let changed_children = affected_tree.fold(
            CompoundWrite::new(),
            &mut |merge_path: &Path, _: &bool, merged: CompoundWrite| {
                let server_cache_path = ack_path.child_path(merge_path);
                if server_cache.is_complete_for_path(&server_cache_path) {
                    merged.add_write(
                        merge_path,
                        get_child(server_cache.variant(), &server_cache_path).clone(),
                    )
                } else {
                    merged
                }
            },
        );
        self.apply_server_merge(
            view_cache,
            ack_path,
            &changed_children,
            writes_cache,
            opt_complete_cache,
            filter_server_node,
            accumulator,
        )
    }

    fn listen_complete(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        writes_cache: &WriteTreeRef<'_>,
        accumulator: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_server_node = view_cache.server_snap();
        let new_view_cache = view_cache.update_server_snap(
            old_server_node.indexed_variant().clone(),
            old_server_node.fully_initialized() || path.is_empty(),
            old_server_node.filtered(),
        );
        self.generate_event_cache_after_server_event(
            &new_view_cache,
            path,
            writes_cache,
            &NoCompleteSource,
            accumulator,
        )
    }
}
