use std::collections::BTreeMap;

use crate::database::path::Path;

/// A sparse tree keyed by path segment, holding an optional value per node.
///
/// Backs the sync point tree, the pending-write overlays and the
/// affected-path sets of acknowledgements.
#[derive(Clone, Debug, PartialEq)]
pub struct Tree<T> {
    value: Option<T>,
    children: BTreeMap<String, Tree<T>>,
}

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: BTreeMap::new(),
        }
    }
}

impl<T> Tree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: Option<T>) -> Self {
        Self {
            value,
            children: BTreeMap::new(),
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn value_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    pub fn set_value(&mut self, value: Option<T>) {
        self.value = value;
    }

    pub fn take_value(&mut self) -> Option<T> {
        self.value.take()
    }

    pub fn children(&self) -> &BTreeMap<String, Tree<T>> {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut BTreeMap<String, Tree<T>> {
        &mut self.children
    }

    /// No value here and no children below.
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.is_empty()
    }

    pub fn get_child(&self, path: &Path) -> Option<&Tree<T>> {
        path.directories()
            .iter()
            .try_fold(self, |tree, key| tree.children.get(key))
    }

    pub fn get_child_mut(&mut self, path: &Path) -> Option<&mut Tree<T>> {
        let mut current = self;
        for key in path.directories() {
            current = current.children.get_mut(key)?;
        }
        Some(current)
    }

    pub fn get_or_make_subtree(&mut self, path: &Path) -> &mut Tree<T> {
        let mut current = self;
        for key in path.directories() {
            current = current.children.entry(key.clone()).or_default();
        }
        current
    }

    pub fn set_value_at(&mut self, path: &Path, value: Option<T>) {
        self.get_or_make_subtree(path).value = value;
    }

    pub fn get_value_at(&self, path: &Path) -> Option<&T> {
        self.get_child(path).and_then(Tree::value)
    }

    /// Drops the subtree at `path` and prunes ancestors left empty. Removing
    /// the root clears the whole tree.
    pub fn remove_subtree(&mut self, path: &Path) {
        fn remove<T>(tree: &mut Tree<T>, directories: &[String]) {
            let Some((front, rest)) = directories.split_first() else {
                return;
            };
            if rest.is_empty() {
                tree.children.remove(front);
                return;
            }
            if let Some(child) = tree.children.get_mut(front) {
                remove(child, rest);
                if child.is_empty() {
                    tree.children.remove(front);
                }
            }
        }
        if path.is_empty() {
            *self = Tree::default();
        } else {
            remove(self, path.directories());
        }
    }

    /// Shallowest path along `path` (root included) whose node holds a value.
    pub fn find_root_most_path_with_value(&self, path: &Path) -> Option<Path> {
        self.find_root_most_matching_path(path, |_| true)
    }

    pub fn find_root_most_matching_path<F>(&self, path: &Path, predicate: F) -> Option<Path>
    where
        F: Fn(&T) -> bool,
    {
        let mut current = self;
        let mut depth = 0;
        loop {
            if current.value.as_ref().is_some_and(&predicate) {
                return Some(Path::from_segments(path.directories()[..depth].iter().cloned()));
            }
            let key = path.directories().get(depth)?;
            current = current.children.get(key)?;
            depth += 1;
        }
    }

    /// Value nearest the root along `path` matching `predicate`.
    pub fn root_most_value_matching<F>(&self, path: &Path, predicate: F) -> Option<&T>
    where
        F: Fn(&T) -> bool,
    {
        let found = self.find_root_most_matching_path(path, predicate)?;
        self.get_value_at(&found)
    }

    /// Value deepest along `path` matching `predicate`.
    pub fn leaf_most_value_matching<F>(&self, path: &Path, predicate: F) -> Option<&T>
    where
        F: Fn(&T) -> bool,
    {
        let mut found = self.value.as_ref().filter(|value| predicate(value));
        let mut current = self;
        for key in path.directories() {
            match current.children.get(key) {
                Some(child) => {
                    current = child;
                    if let Some(value) = child.value.as_ref().filter(|value| predicate(value)) {
                        found = Some(value);
                    }
                }
                None => break,
            }
        }
        found
    }

    pub fn contains_matching_value<F>(&self, predicate: &F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        self.value.as_ref().is_some_and(predicate)
            || self
                .children
                .values()
                .any(|child| child.contains_matching_value(predicate))
    }

    /// Post-order fold: children (in key order) before the node itself.
    pub fn fold<A, F>(&self, accum: A, visitor: &mut F) -> A
    where
        F: FnMut(&Path, &T, A) -> A,
    {
        self.fold_at(&Path::root(), accum, visitor)
    }

    fn fold_at<A, F>(&self, relative: &Path, mut accum: A, visitor: &mut F) -> A
    where
        F: FnMut(&Path, &T, A) -> A,
    {
        for (key, child) in &self.children {
            accum = child.fold_at(&relative.child(key), accum, visitor);
        }
        if let Some(value) = &self.value {
            accum = visitor(relative, value, accum);
        }
        accum
    }

    /// Pre-order visit of every value, with its path relative to this node.
    pub fn call_on_each<F>(&self, visitor: &mut F)
    where
        F: FnMut(&Path, &T),
    {
        self.call_on_each_at(&Path::root(), visitor);
    }

    fn call_on_each_at<F>(&self, relative: &Path, visitor: &mut F)
    where
        F: FnMut(&Path, &T),
    {
        if let Some(value) = &self.value {
            visitor(relative, value);
        }
        for (key, child) in &self.children {
            child.call_on_each_at(&relative.child(key), visitor);
        }
    }
}
