use serde_json::Value;

use crate::database::path::Path;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::util::dev_assert;

/// One half of a view's cache: the data plus how much of it is known.
///
/// `fully_initialized == false` means children may be missing. `filtered`
/// means the data was passed through a query filter, so the absence of a
/// child says nothing about the underlying location.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheNode {
    indexed_variant: IndexedVariant,
    fully_initialized: bool,
    filtered: bool,
}

impl CacheNode {
    pub fn new(indexed_variant: IndexedVariant, fully_initialized: bool, filtered: bool) -> Self {
        Self {
            indexed_variant,
            fully_initialized,
            filtered,
        }
    }

    pub fn indexed_variant(&self) -> &IndexedVariant {
        &self.indexed_variant
    }

    pub fn variant(&self) -> &Value {
        self.indexed_variant.variant()
    }

    pub fn fully_initialized(&self) -> bool {
        self.fully_initialized
    }

    pub fn filtered(&self) -> bool {
        self.filtered
    }

    pub fn is_complete_for_path(&self, path: &Path) -> bool {
        match path.front_directory() {
            None => self.fully_initialized && !self.filtered,
            Some(key) => self.is_complete_for_child(key),
        }
    }

    pub fn is_complete_for_child(&self, key: &str) -> bool {
        (self.fully_initialized && !self.filtered) || self.indexed_variant.has_child(key)
    }

    pub fn complete_variant(&self) -> Option<&Value> {
        self.fully_initialized.then(|| self.variant())
    }
}

/// The local (event) and server halves a view is built from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ViewCache {
    local_snap: CacheNode,
    server_snap: CacheNode,
}

impl ViewCache {
    pub fn new(local_snap: CacheNode, server_snap: CacheNode) -> Self {
        Self {
            local_snap,
            server_snap,
        }
    }

    pub fn local_snap(&self) -> &CacheNode {
        &self.local_snap
    }

    pub fn server_snap(&self) -> &CacheNode {
        &self.server_snap
    }

    pub fn update_local_snap(
        &self,
        local_snap: IndexedVariant,
        complete: bool,
        filtered: bool,
    ) -> ViewCache {
        ViewCache::new(
            CacheNode::new(local_snap, complete, filtered),
            self.server_snap.clone(),
        )
    }

    pub fn update_server_snap(
        &self,
        server_snap: IndexedVariant,
        complete: bool,
        filtered: bool,
    ) -> ViewCache {
        dev_assert(
            complete || !self.server_snap.fully_initialized,
            "Once a server snap is complete, it should never go back",
        );
        ViewCache::new(
            self.local_snap.clone(),
            CacheNode::new(server_snap, complete, filtered),
        )
    }

    pub fn complete_local_snap(&self) -> Option<&Value> {
        self.local_snap.complete_variant()
    }

    pub fn complete_server_snap(&self) -> Option<&Value> {
        self.server_snap.complete_variant()
    }
}
