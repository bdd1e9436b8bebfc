use serde_json::Value;

use crate::database::error::DatabaseResult;
use crate::database::path::Path;
use crate::database::query::QuerySpec;
use crate::database::variant::{child_count, get_child, get_priority, get_value, is_empty};

/// Data delivered to listeners, analogous to the JS `DataSnapshot` type.
///
/// The snapshot owns a copy of the data at `query_spec.path`, priorities
/// included.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSnapshot {
    value: Value,
    query_spec: QuerySpec,
}

impl DataSnapshot {
    pub fn new(value: Value, query_spec: QuerySpec) -> Self {
        Self { value, query_spec }
    }

    /// The data without its priority.
    pub fn value(&self) -> &Value {
        get_value(&self.value)
    }

    pub fn priority(&self) -> &Value {
        get_priority(&self.value)
    }

    /// Returns the data with priority metadata, as stored by the sync tree.
    pub fn to_json(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn query_spec(&self) -> &QuerySpec {
        &self.query_spec
    }

    pub fn path(&self) -> &Path {
        &self.query_spec.path
    }

    /// The last path segment; `None` at the root.
    pub fn key(&self) -> Option<&str> {
        self.query_spec.path.back()
    }

    pub fn exists(&self) -> bool {
        !is_empty(&self.value)
    }

    /// Returns a snapshot of the data at `relative_path`, mirroring
    /// `DataSnapshot.child(path)` in the JS SDK.
    pub fn child(&self, relative_path: &str) -> DatabaseResult<DataSnapshot> {
        let relative = Path::parse(relative_path)?;
        Ok(DataSnapshot {
            value: get_child(&self.value, &relative).clone(),
            query_spec: QuerySpec::new(self.query_spec.path.child_path(&relative)),
        })
    }

    pub fn has_child(&self, relative_path: &str) -> DatabaseResult<bool> {
        let relative = Path::parse(relative_path)?;
        Ok(!is_empty(get_child(&self.value, &relative)))
    }

    pub fn has_children(&self) -> bool {
        self.children_count() > 0
    }

    /// Number of direct children, `.priority` excluded.
    pub fn children_count(&self) -> usize {
        child_count(&self.value)
    }
}
