use std::collections::BTreeMap;

use serde_json::Value;

use crate::database::core::tree::Tree;
use crate::database::path::Path;
use crate::database::variant::{
    children, get_child, get_value, is_empty, is_priority_key, update_child,
};
use crate::util::dev_assert;

/// A set of overwrites at distinct paths, applied together on top of some
/// base data.
///
/// A write at a path shadows everything written below it: later writes under
/// an existing write are folded into that write's value instead of being kept
/// separately.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompoundWrite {
    write_tree: Tree<Value>,
}

impl CompoundWrite {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_tree(write_tree: Tree<Value>) -> Self {
        Self { write_tree }
    }

    /// Builds a merge from `child key -> value` pairs; keys may contain
    /// slashes to address deeper locations.
    pub fn from_child_merge<'a, I>(merge: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut write_tree = Tree::new();
        for (key, value) in merge {
            write_tree.set_value_at(&Path::new(key), Some(value.clone()));
        }
        Self::from_tree(write_tree)
    }

    /// An object becomes a merge of its entries; any other value becomes a
    /// root overwrite.
    pub fn from_variant_merge(merge: &Value) -> Self {
        match merge {
            Value::Object(obj) => Self::from_child_merge(obj.iter()),
            other => Self::from_tree(Tree::with_value(Some(other.clone()))),
        }
    }

    pub fn from_path_merge(merge: &BTreeMap<Path, Value>) -> Self {
        let mut write_tree = Tree::new();
        for (path, value) in merge {
            write_tree.set_value_at(path, Some(value.clone()));
        }
        Self::from_tree(write_tree)
    }

    pub fn write_tree(&self) -> &Tree<Value> {
        &self.write_tree
    }

    pub fn is_empty(&self) -> bool {
        self.write_tree.is_empty()
    }

    pub fn root_write(&self) -> Option<&Value> {
        self.write_tree.value()
    }

    pub fn add_write(&self, path: &Path, value: Value) -> Self {
        let mut target = self.clone();
        target.add_write_inline(path, value);
        target
    }

    pub fn add_write_inline(&mut self, path: &Path, value: Value) {
        if path.is_empty() {
            self.write_tree = Tree::with_value(Some(value));
            return;
        }
        let Some(root_most) = self.write_tree.find_root_most_path_with_value(path) else {
            *self.write_tree.get_or_make_subtree(path) = Tree::with_value(Some(value));
            return;
        };
        let relative = Path::get_relative(&root_most, path).unwrap_or_default();
        let Some(existing) = self.write_tree.get_value_at(&root_most) else {
            return;
        };
        // A priority written under a node the shadowing write leaves empty has
        // nothing to attach to.
        let orphan_priority = relative.back().is_some_and(is_priority_key)
            && is_empty(get_child(existing, &relative.parent()));
        if orphan_priority {
            return;
        }
        let mut updated = existing.clone();
        update_child(&mut updated, &relative, value);
        self.write_tree.set_value_at(&root_most, Some(updated));
    }

    pub fn add_writes(&self, path: &Path, updates: &CompoundWrite) -> Self {
        let mut target = self.clone();
        target.add_writes_inline(path, updates);
        target
    }

    pub fn add_writes_inline(&mut self, path: &Path, updates: &CompoundWrite) {
        updates.write_tree.fold((), &mut |relative, value, ()| {
            self.add_write_inline(&path.child_path(relative), value.clone());
        });
    }

    pub fn remove_write(&self, path: &Path) -> Self {
        let mut target = self.clone();
        target.remove_write_inline(path);
        target
    }

    pub fn remove_write_inline(&mut self, path: &Path) {
        self.write_tree.remove_subtree(path);
    }

    /// Whether the data at `path` is fully determined by these writes.
    pub fn has_complete_write(&self, path: &Path) -> bool {
        self.get_complete_variant(path).is_some()
    }

    pub fn get_complete_variant(&self, path: &Path) -> Option<Value> {
        let root_most = self.write_tree.find_root_most_path_with_value(path)?;
        let value = self.write_tree.get_value_at(&root_most)?;
        let remaining = Path::get_relative(&root_most, path)?;
        Some(get_child(value, &remaining).clone())
    }

    /// Immediate children whose complete value is known.
    pub fn get_complete_children(&self) -> Vec<(String, Value)> {
        match self.write_tree.value() {
            Some(root) => match get_value(root) {
                Value::Object(obj) => obj
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
                _ => Vec::new(),
            },
            None => self
                .write_tree
                .children()
                .iter()
                .filter_map(|(key, subtree)| {
                    subtree.value().map(|value| (key.clone(), value.clone()))
                })
                .collect(),
        }
    }

    /// The writes as seen from `path`.
    pub fn child_compound_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return self.clone();
        }
        if let Some(shadowing) = self.get_complete_variant(path) {
            return Self::from_tree(Tree::with_value(Some(shadowing)));
        }
        self.write_tree
            .get_child(path)
            .cloned()
            .map(Self::from_tree)
            .unwrap_or_default()
    }

    pub fn child_compound_writes(&self) -> BTreeMap<String, CompoundWrite> {
        self.write_tree
            .children()
            .iter()
            .map(|(key, subtree)| (key.clone(), Self::from_tree(subtree.clone())))
            .collect()
    }

    /// Layers every write onto `variant`. Priority writes are applied after
    /// their siblings and only when the node they decorate ends up non-empty.
    pub fn apply(&self, variant: &Value) -> Value {
        Self::apply_subtree_write(&Path::root(), &self.write_tree, variant.clone())
    }

    fn apply_subtree_write(relative: &Path, write_tree: &Tree<Value>, mut variant: Value) -> Value {
        if let Some(value) = write_tree.value() {
            update_child(&mut variant, relative, value.clone());
            return variant;
        }
        let mut priority_write = None;
        for (key, child_tree) in write_tree.children() {
            if is_priority_key(key) {
                dev_assert(
                    child_tree.children().is_empty(),
                    "Priority writes must always be leaf variants",
                );
                priority_write = child_tree.value();
            } else {
                variant = Self::apply_subtree_write(&relative.child(key), child_tree, variant);
            }
        }
        if let Some(priority) = priority_write {
            if !is_empty(get_child(&variant, relative)) {
                update_child(&mut variant, &relative.child(".priority"), priority.clone());
            }
        }
        variant
    }

    /// Keys of the children touched by this write, for building the affected
    /// tree of a merge acknowledgement.
    pub fn child_keys(&self) -> Vec<String> {
        match self.write_tree.value() {
            Some(root) => children(root).map(|(key, _)| key.clone()).collect(),
            None => self.write_tree.children().keys().cloned().collect(),
        }
    }
}
