//! Log of local writes that the server has not acknowledged yet.
//!
//! Every user write lands here with a monotonically increasing id. Visible
//! writes are also folded into a single [`CompoundWrite`] overlay so the
//! effective value at any location is "server cache with pending writes
//! layered on top". When the server acknowledges (or rejects) a write it is
//! removed again; [`WriteTree::remove_write`] reports whether anything that
//! views already materialized has to be recomputed.
//!
//! [`WriteTreeRef`] is a borrowed, path-scoped handle used by views so they
//! can ask questions relative to their own location.

use std::cmp::Ordering;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::database::comparator::{Post, QueryParamsComparator};
use crate::database::core::compound_write::CompoundWrite;
use crate::database::path::Path;
use crate::database::query::QueryParams;
use crate::database::variant::{children, get_child, get_immediate_child, set_variant_at_path};
use crate::database::view::view_cache::CacheNode;
use crate::util::dev_assert;

pub type WriteId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverwriteVisibility {
    Visible,
    Invisible,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HiddenWriteInclusion {
    Exclude,
    Include,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterationDirection {
    Forward,
    Reverse,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserWrite {
    Overwrite(Value),
    Merge(CompoundWrite),
}

/// One pending local write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserWriteRecord {
    pub write_id: WriteId,
    pub path: Path,
    pub write: UserWrite,
    pub visible: bool,
}

impl UserWriteRecord {
    pub fn overwrite(write_id: WriteId, path: Path, data: Value, visible: bool) -> Self {
        Self {
            write_id,
            path,
            write: UserWrite::Overwrite(data),
            visible,
        }
    }

    pub fn merge(write_id: WriteId, path: Path, merge: CompoundWrite) -> Self {
        Self {
            write_id,
            path,
            write: UserWrite::Merge(merge),
            visible: true,
        }
    }

    pub fn is_overwrite(&self) -> bool {
        matches!(self.write, UserWrite::Overwrite(_))
    }

    /// Whether this write touches `path` or one of its ancestors.
    fn contains_path(&self, path: &Path) -> bool {
        match &self.write {
            UserWrite::Overwrite(_) => self.path.is_parent_of(path),
            UserWrite::Merge(merge) => {
                let mut found = false;
                merge.write_tree().call_on_each(&mut |relative, _| {
                    if self.path.child_path(relative).is_parent_of(path) {
                        found = true;
                    }
                });
                found
            }
        }
    }
}

/// Merges persist as a flat `{"relative/path": value}` object.
impl Serialize for CompoundWrite {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut flat = Map::new();
        self.write_tree().call_on_each(&mut |path, value| {
            flat.insert(path.to_string(), value.clone());
        });
        Value::Object(flat).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CompoundWrite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Object(flat) => {
                let mut write = CompoundWrite::new();
                for (path, value) in flat {
                    write.add_write_inline(&Path::new(&path), value);
                }
                Ok(write)
            }
            other => Err(D::Error::custom(format!(
                "expected an object of path/value pairs, found {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WriteTree {
    visible_writes: CompoundWrite,
    all_writes: Vec<UserWriteRecord>,
    last_write_id: Option<WriteId>,
}

impl WriteTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that answers queries relative to `path`.
    pub fn child_writes(&self, path: &Path) -> WriteTreeRef<'_> {
        WriteTreeRef::new(path.clone(), self)
    }

    fn assert_increasing(&self, write_id: WriteId) {
        dev_assert(
            self.last_write_id.map_or(true, |last| write_id > last),
            "Stacking an older write on top of newer ones",
        );
    }

    pub fn add_overwrite(
        &mut self,
        path: &Path,
        data: Value,
        write_id: WriteId,
        visibility: OverwriteVisibility,
    ) {
        self.assert_increasing(write_id);
        let visible = visibility == OverwriteVisibility::Visible;
        if visible {
            self.visible_writes.add_write_inline(path, data.clone());
        }
        self.all_writes
            .push(UserWriteRecord::overwrite(write_id, path.clone(), data, visible));
        self.last_write_id = Some(write_id);
    }

    pub fn add_merge(&mut self, path: &Path, changed_children: CompoundWrite, write_id: WriteId) {
        self.assert_increasing(write_id);
        self.visible_writes.add_writes_inline(path, &changed_children);
        self.all_writes
            .push(UserWriteRecord::merge(write_id, path.clone(), changed_children));
        self.last_write_id = Some(write_id);
    }

    pub fn get_write(&self, write_id: WriteId) -> Option<&UserWriteRecord> {
        self.all_writes
            .iter()
            .find(|record| record.write_id == write_id)
    }

    pub fn all_writes(&self) -> &[UserWriteRecord] {
        &self.all_writes
    }

    /// Drops every pending write, returning them in insertion order.
    pub fn purge_all_writes(&mut self) -> Vec<UserWriteRecord> {
        self.visible_writes = CompoundWrite::new();
        std::mem::take(&mut self.all_writes)
    }

    /// Removes a write, returning whether views need to re-evaluate.
    ///
    /// A removal is invisible when a later visible write already covers the
    /// location, since the effective value does not change.
    pub fn remove_write(&mut self, write_id: WriteId) -> bool {
        let Some(index) = self
            .all_writes
            .iter()
            .position(|record| record.write_id == write_id)
        else {
            dev_assert(false, "remove_write called with nonexistent write_id");
            return false;
        };
        let removed = self.all_writes.remove(index);

        let mut removed_was_visible = removed.visible;
        let mut overlaps_other_writes = false;
        for (position, current) in self.all_writes.iter().enumerate().rev() {
            if !removed_was_visible {
                break;
            }
            if !current.visible {
                continue;
            }
            if position >= index && current.contains_path(&removed.path) {
                removed_was_visible = false;
            } else if removed.path.is_parent_of(&current.path) {
                overlaps_other_writes = true;
            }
        }

        if !removed_was_visible {
            false
        } else if overlaps_other_writes {
            self.reset_tree();
            true
        } else {
            match &removed.write {
                UserWrite::Overwrite(_) => self.visible_writes.remove_write_inline(&removed.path),
                UserWrite::Merge(merge) => {
                    for key in merge.write_tree().children().keys() {
                        self.visible_writes
                            .remove_write_inline(&removed.path.child(key));
                    }
                }
            }
            true
        }
    }

    pub fn get_complete_write_data(&self, path: &Path) -> Option<Value> {
        self.visible_writes.get_complete_variant(path)
    }

    pub fn shadowing_write(&self, path: &Path) -> Option<Value> {
        self.visible_writes.get_complete_variant(path)
    }

    /// Effective data at `tree_path`: pending writes over the server cache.
    /// `None` when neither the cache nor the writes fully determine it.
    pub fn calc_complete_event_cache(
        &self,
        tree_path: &Path,
        complete_server_cache: Option<&Value>,
        write_ids_to_exclude: &[WriteId],
        include_hidden_writes: HiddenWriteInclusion,
    ) -> Option<Value> {
        let include_hidden = include_hidden_writes == HiddenWriteInclusion::Include;
        if write_ids_to_exclude.is_empty() && !include_hidden {
            if let Some(shadowing) = self.shadowing_write(tree_path) {
                return Some(shadowing);
            }
            let sub_merge = self.visible_writes.child_compound_write(tree_path);
            if sub_merge.is_empty() {
                return complete_server_cache.cloned();
            }
            if complete_server_cache.is_none() && !sub_merge.has_complete_write(&Path::root()) {
                return None;
            }
            return Some(sub_merge.apply(complete_server_cache.unwrap_or(&Value::Null)));
        }

        let merge = self.visible_writes.child_compound_write(tree_path);
        if !include_hidden && merge.is_empty() {
            return complete_server_cache.cloned();
        }
        if !include_hidden
            && complete_server_cache.is_none()
            && !merge.has_complete_write(&Path::root())
        {
            return None;
        }
        let filter = |write: &UserWriteRecord| {
            (write.visible || include_hidden)
                && !write_ids_to_exclude.contains(&write.write_id)
                && (write.path.is_parent_of(tree_path) || tree_path.is_parent_of(&write.path))
        };
        let merge_at_path = Self::layer_tree(&self.all_writes, filter, tree_path);
        Some(merge_at_path.apply(complete_server_cache.unwrap_or(&Value::Null)))
    }

    /// Children at `tree_path` that are complete once writes are applied:
    /// every server child (with writes layered in) plus children written in
    /// full.
    pub fn calc_complete_event_children(
        &self,
        tree_path: &Path,
        complete_server_children: &Value,
    ) -> Value {
        let mut complete_children = Value::Null;
        if let Some(top_level_set) = self.visible_writes.get_complete_variant(tree_path) {
            if top_level_set.is_object() {
                complete_children = top_level_set;
            }
            return complete_children;
        }
        let merge = self.visible_writes.child_compound_write(tree_path);
        for (key, value) in children(complete_server_children) {
            let key_path = Path::from_segments([key.as_str()]);
            let applied = merge.child_compound_write(&key_path).apply(value);
            set_variant_at_path(&mut complete_children, &key_path, applied);
        }
        for (key, value) in merge.get_complete_children() {
            set_variant_at_path(&mut complete_children, &Path::from_segments([key]), value);
        }
        complete_children
    }

    /// Event cache for `tree_path/child_path` after the server overwrote it,
    /// or `None` when a complete local write hides the server data.
    pub fn calc_event_cache_after_server_overwrite(
        &self,
        tree_path: &Path,
        child_path: &Path,
        existing_local_snap: Option<&Value>,
        existing_server_snap: Option<&Value>,
    ) -> Option<Value> {
        dev_assert(
            existing_local_snap.is_some() || existing_server_snap.is_some(),
            "Either existing_local_snap or existing_server_snap must exist",
        );
        let path = tree_path.child_path(child_path);
        if self.visible_writes.has_complete_write(&path) {
            return None;
        }
        let server_child = existing_server_snap
            .map(|snap| get_child(snap, child_path).clone())
            .unwrap_or(Value::Null);
        let child_merge = self.visible_writes.child_compound_write(&path);
        if child_merge.is_empty() {
            Some(server_child)
        } else {
            Some(child_merge.apply(&server_child))
        }
    }

    pub fn calc_complete_child(
        &self,
        tree_path: &Path,
        child_key: &str,
        existing_server_snap: &CacheNode,
    ) -> Option<Value> {
        let path = tree_path.child(child_key);
        if let Some(shadowing) = self.visible_writes.get_complete_variant(&path) {
            return Some(shadowing);
        }
        if existing_server_snap.is_complete_for_child(child_key) {
            let child_merge = self.visible_writes.child_compound_write(&path);
            let child = get_immediate_child(existing_server_snap.variant(), child_key);
            return Some(child_merge.apply(child));
        }
        None
    }

    /// The child that sorts immediately after (or before, in reverse) `post`
    /// in the effective data at `tree_path`.
    pub fn calc_next_variant_after_post(
        &self,
        tree_path: &Path,
        complete_server_data: Option<&Value>,
        post: &Post,
        direction: IterationDirection,
        params: &QueryParams,
    ) -> Option<(String, Value)> {
        let merge = self.visible_writes.child_compound_write(tree_path);
        let to_iterate = match merge.get_complete_variant(&Path::root()) {
            Some(shadowing) => shadowing,
            None => merge.apply(complete_server_data?),
        };
        let comparator = QueryParamsComparator::new(params);
        let ahead = |candidate: Ordering| match direction {
            IterationDirection::Forward => candidate == Ordering::Greater,
            IterationDirection::Reverse => candidate == Ordering::Less,
        };
        let mut current_next: Option<(&String, &Value)> = None;
        for (key, value) in children(&to_iterate) {
            let candidate = Post::node(key.clone(), value.clone());
            if !ahead(comparator.compare_posts(&candidate, post)) {
                continue;
            }
            let closer = match current_next {
                None => true,
                Some((next_key, next_value)) => {
                    ahead(comparator.compare(next_key, next_value, key, value))
                }
            };
            if closer {
                current_next = Some((key, value));
            }
        }
        current_next.map(|(key, value)| (key.clone(), value.clone()))
    }

    fn reset_tree(&mut self) {
        self.visible_writes = Self::layer_tree(&self.all_writes, |write| write.visible, &Path::root());
        self.last_write_id = self.all_writes.last().map(|write| write.write_id);
    }

    /// Folds the writes accepted by `filter` into one overlay rooted at
    /// `tree_root`.
    fn layer_tree<F>(writes: &[UserWriteRecord], filter: F, tree_root: &Path) -> CompoundWrite
    where
        F: Fn(&UserWriteRecord) -> bool,
    {
        let mut compound_write = CompoundWrite::new();
        for write in writes.iter().filter(|write| filter(write)) {
            match &write.write {
                UserWrite::Overwrite(data) => {
                    if let Some(relative) = Path::get_relative(tree_root, &write.path) {
                        compound_write.add_write_inline(&relative, data.clone());
                    } else if let Some(relative) = Path::get_relative(&write.path, tree_root) {
                        compound_write
                            .add_write_inline(&Path::root(), get_child(data, &relative).clone());
                    }
                }
                UserWrite::Merge(merge) => {
                    if let Some(relative) = Path::get_relative(tree_root, &write.path) {
                        compound_write.add_writes_inline(&relative, merge);
                    } else if let Some(relative) = Path::get_relative(&write.path, tree_root) {
                        if relative.is_empty() {
                            compound_write.add_writes_inline(&Path::root(), merge);
                        } else if let Some(deep_node) = merge.get_complete_variant(&relative) {
                            compound_write.add_write_inline(&Path::root(), deep_node);
                        }
                    }
                }
            }
        }
        compound_write
    }
}

/// A [`WriteTree`] seen from one location.
#[derive(Clone, Debug)]
pub struct WriteTreeRef<'a> {
    path: Path,
    write_tree: &'a WriteTree,
}

impl<'a> WriteTreeRef<'a> {
    pub fn new(path: Path, write_tree: &'a WriteTree) -> Self {
        Self { path, write_tree }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn child(&self, key: &str) -> WriteTreeRef<'a> {
        WriteTreeRef::new(self.path.child(key), self.write_tree)
    }

    pub fn calc_complete_event_cache(&self, complete_server_cache: Option<&Value>) -> Option<Value> {
        self.write_tree.calc_complete_event_cache(
            &self.path,
            complete_server_cache,
            &[],
            HiddenWriteInclusion::Exclude,
        )
    }

    pub fn calc_complete_event_cache_excluding(
        &self,
        complete_server_cache: Option<&Value>,
        write_ids_to_exclude: &[WriteId],
        include_hidden_writes: HiddenWriteInclusion,
    ) -> Option<Value> {
        self.write_tree.calc_complete_event_cache(
            &self.path,
            complete_server_cache,
            write_ids_to_exclude,
            include_hidden_writes,
        )
    }

    pub fn calc_complete_event_children(&self, complete_server_children: &Value) -> Value {
        self.write_tree
            .calc_complete_event_children(&self.path, complete_server_children)
    }

    pub fn calc_event_cache_after_server_overwrite(
        &self,
        child_path: &Path,
        existing_local_snap: Option<&Value>,
        existing_server_snap: Option<&Value>,
    ) -> Option<Value> {
        self.write_tree.calc_event_cache_after_server_overwrite(
            &self.path,
            child_path,
            existing_local_snap,
            existing_server_snap,
        )
    }

    pub fn shadowing_write(&self, path: &Path) -> Option<Value> {
        self.write_tree.shadowing_write(&self.path.child_path(path))
    }

    pub fn calc_next_variant_after_post(
        &self,
        complete_server_data: Option<&Value>,
        post: &Post,
        direction: IterationDirection,
        params: &QueryParams,
    ) -> Option<(String, Value)> {
        self.write_tree.calc_next_variant_after_post(
            &self.path,
            complete_server_data,
            post,
            direction,
            params,
        )
    }

    pub fn calc_complete_child(
        &self,
        child_key: &str,
        existing_server_cache: &CacheNode,
    ) -> Option<Value> {
        self.write_tree
            .calc_complete_child(&self.path, child_key, existing_server_cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::view::indexed_variant::IndexedVariant;
    use serde_json::json;

    fn overwrite(tree: &mut WriteTree, path: &str, data: Value, id: WriteId) {
        tree.add_overwrite(&Path::new(path), data, id, OverwriteVisibility::Visible);
    }

    #[test]
    fn writes_layer_over_server_cache() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "a/b", json!(1), 1);
        let server = json!({ "b": 0, "c": 2 });
        assert_eq!(
            tree.calc_complete_event_cache(
                &Path::new("a"),
                Some(&server),
                &[],
                HiddenWriteInclusion::Exclude
            ),
            Some(json!({ "b": 1, "c": 2 }))
        );
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("a"), None, &[], HiddenWriteInclusion::Exclude),
            None
        );
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("a/b"), None, &[], HiddenWriteInclusion::Exclude),
            Some(json!(1))
        );
    }

    #[test]
    fn excluded_writes_are_skipped() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "a", json!({ "x": 1 }), 1);
        overwrite(&mut tree, "a/y", json!(2), 2);
        let without_second = tree.calc_complete_event_cache(
            &Path::new("a"),
            Some(&json!({})),
            &[2],
            HiddenWriteInclusion::Exclude,
        );
        assert_eq!(without_second, Some(json!({ "x": 1 })));
    }

    #[test]
    fn hidden_writes_only_show_when_included() {
        let mut tree = WriteTree::new();
        tree.add_overwrite(&Path::new("a"), json!(5), 1, OverwriteVisibility::Invisible);
        assert_eq!(tree.shadowing_write(&Path::new("a")), None);
        assert_eq!(
            tree.calc_complete_event_cache(&Path::new("a"), None, &[], HiddenWriteInclusion::Include),
            Some(json!(5))
        );
        assert!(!tree.remove_write(1));
    }

    #[test]
    fn removing_shadowed_write_needs_no_reevaluation() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "a/b", json!(1), 1);
        overwrite(&mut tree, "a", json!({ "b": 2 }), 2);
        assert!(!tree.remove_write(1));
        assert_eq!(tree.shadowing_write(&Path::new("a/b")), Some(json!(2)));
        assert!(tree.remove_write(2));
        assert_eq!(tree.shadowing_write(&Path::new("a")), None);
        assert!(tree.all_writes().is_empty());
    }

    #[test]
    fn removing_overlapping_write_rebuilds_overlay() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "a", json!({ "b": 1, "c": 1 }), 1);
        overwrite(&mut tree, "a/c", json!(3), 2);
        assert!(tree.remove_write(1));
        assert_eq!(tree.shadowing_write(&Path::new("a/c")), Some(json!(3)));
        assert_eq!(tree.shadowing_write(&Path::new("a/b")), None);
    }

    #[test]
    fn merges_remove_each_child() {
        let mut tree = WriteTree::new();
        let merge = CompoundWrite::from_variant_merge(&json!({ "x": 1, "y": 2 }));
        tree.add_merge(&Path::new("m"), merge, 1);
        assert_eq!(tree.shadowing_write(&Path::new("m/y")), Some(json!(2)));
        assert!(tree.get_write(1).is_some_and(|record| !record.is_overwrite()));
        assert!(tree.remove_write(1));
        assert_eq!(tree.shadowing_write(&Path::new("m/x")), None);
    }

    #[test]
    fn complete_children_include_written_children() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "p/new", json!("n"), 1);
        let children = tree.calc_complete_event_children(&Path::new("p"), &json!({ "old": "o" }));
        assert_eq!(children, json!({ "new": "n", "old": "o" }));
        overwrite(&mut tree, "p", json!(3), 2);
        assert_eq!(
            tree.calc_complete_event_children(&Path::new("p"), &json!({ "old": "o" })),
            Value::Null
        );
    }

    #[test]
    fn server_overwrite_hidden_by_complete_write() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "a/b", json!(1), 1);
        let server = json!({ "b": 0, "c": 5 });
        assert_eq!(
            tree.calc_event_cache_after_server_overwrite(
                &Path::new("a"),
                &Path::new("b"),
                None,
                Some(&server)
            ),
            None
        );
        assert_eq!(
            tree.calc_event_cache_after_server_overwrite(
                &Path::new("a"),
                &Path::new("c"),
                None,
                Some(&server)
            ),
            Some(json!(5))
        );
    }

    #[test]
    fn complete_child_prefers_writes_then_cache() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "a/w", json!("written"), 1);
        let cache = CacheNode::new(IndexedVariant::new(json!({ "s": "server" })), true, false);
        assert_eq!(
            tree.calc_complete_child(&Path::new("a"), "w", &cache),
            Some(json!("written"))
        );
        assert_eq!(
            tree.calc_complete_child(&Path::new("a"), "s", &cache),
            Some(json!("server"))
        );
        let partial = CacheNode::new(IndexedVariant::new(json!({ "s": "server" })), false, false);
        assert_eq!(tree.calc_complete_child(&Path::new("a"), "q", &partial), None);
    }

    #[test]
    fn next_variant_after_post_respects_direction() {
        let tree = WriteTree::new();
        let params = QueryParams::new().order_by_value().unwrap();
        let data = json!({ "a": 1, "b": 2, "c": 3 });
        let post = Post::node("b", json!(2));
        assert_eq!(
            tree.calc_next_variant_after_post(
                &Path::root(),
                Some(&data),
                &post,
                IterationDirection::Forward,
                &params
            ),
            Some(("c".to_string(), json!(3)))
        );
        assert_eq!(
            tree.calc_next_variant_after_post(
                &Path::root(),
                Some(&data),
                &post,
                IterationDirection::Reverse,
                &params
            ),
            Some(("a".to_string(), json!(1)))
        );
        assert_eq!(
            tree.calc_next_variant_after_post(
                &Path::root(),
                None,
                &post,
                IterationDirection::Forward,
                &params
            ),
            None
        );
    }

    #[test]
    fn write_tree_ref_scopes_queries() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "a/b/c", json!(1), 1);
        let writes = tree.child_writes(&Path::new("a"));
        assert_eq!(writes.child("b").path(), &Path::new("a/b"));
        assert_eq!(writes.shadowing_write(&Path::new("b/c")), Some(json!(1)));
        assert_eq!(
            writes.child("b").calc_complete_event_cache(None),
            None
        );
    }

    #[test]
    fn purge_returns_writes_in_order() {
        let mut tree = WriteTree::new();
        overwrite(&mut tree, "a", json!(1), 1);
        overwrite(&mut tree, "b", json!(2), 2);
        let purged = tree.purge_all_writes();
        assert_eq!(
            purged.iter().map(|record| record.write_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(tree.shadowing_write(&Path::new("a")), None);
    }

    #[test]
    fn records_serialize_with_flat_merges() {
        let record = UserWriteRecord::merge(
            7,
            Path::new("m"),
            CompoundWrite::from_variant_merge(&json!({ "x/y": 1 })),
        );
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["write"]["merge"], json!({ "x/y": 1 }));
        let decoded: UserWriteRecord = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
