use std::cmp::Ordering;

use serde_json::Value;

use crate::database::comparator::QueryParamsComparator;
use crate::database::query::QueryParams;
use crate::database::variant::{
    children, combine_value_and_priority, get_value, is_empty, is_leaf, update_immediate_child,
};

/// Data plus its children sorted under the ordering of `params`.
///
/// The sorted index is kept up to date on every update so predecessor and
/// first/last lookups never need to re-sort.
#[derive(Clone, Debug, Default)]
pub struct IndexedVariant {
    variant: Value,
    params: QueryParams,
    index: Vec<(String, Value)>,
}

impl PartialEq for IndexedVariant {
    fn eq(&self, other: &Self) -> bool {
        self.variant == other.variant && self.params == other.params
    }
}

impl IndexedVariant {
    pub fn new(variant: Value) -> Self {
        Self::with_params(variant, QueryParams::default())
    }

    pub fn with_params(variant: Value, params: QueryParams) -> Self {
        let mut index: Vec<(String, Value)> = children(&variant)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let comparator = QueryParamsComparator::new(&params);
        index.sort_by(|(key_a, value_a), (key_b, value_b)| {
            comparator.compare(key_a, value_a, key_b, value_b)
        });
        Self {
            variant,
            params,
            index,
        }
    }

    pub fn variant(&self) -> &Value {
        &self.variant
    }

    pub fn query_params(&self) -> &QueryParams {
        &self.params
    }

    /// Children in sorted order.
    pub fn index(&self) -> &[(String, Value)] {
        &self.index
    }

    pub fn has_child(&self, key: &str) -> bool {
        self.child(key).is_some()
    }

    pub fn child(&self, key: &str) -> Option<&Value> {
        match get_value(&self.variant) {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn child_count(&self) -> usize {
        self.index.len()
    }

    /// Replaces (or removes, when `child` is empty) one child.
    pub fn update_child(&self, key: &str, child: Value) -> IndexedVariant {
        let mut updated = self.clone();
        update_immediate_child(&mut updated.variant, key, child);
        updated.index.retain(|(existing, _)| existing != key);
        if !is_leaf(&updated.variant) {
            if let Some(stored) = updated.child(key).cloned() {
                let comparator = QueryParamsComparator::new(&updated.params);
                let position = updated.index.partition_point(|(other_key, other_value)| {
                    comparator.compare(other_key, other_value, key, &stored) == Ordering::Less
                });
                updated.index.insert(position, (key.to_string(), stored));
            }
        } else {
            updated.index.clear();
        }
        updated
    }

    pub fn update_priority(&self, priority: &Value) -> IndexedVariant {
        let variant = combine_value_and_priority(&self.variant, priority);
        let mut updated = self.clone();
        updated.variant = variant;
        updated
    }

    pub fn first_child(&self) -> Option<&(String, Value)> {
        self.index.first()
    }

    pub fn last_child(&self) -> Option<&(String, Value)> {
        self.index.last()
    }

    /// Key of the child sorting immediately before `(key, child)`, if any.
    pub fn predecessor_child_name(&self, key: &str, child: &Value) -> Option<String> {
        let comparator = QueryParamsComparator::new(&self.params);
        let position = self.index.partition_point(|(other_key, other_value)| {
            comparator.compare(other_key, other_value, key, child) == Ordering::Less
        });
        position
            .checked_sub(1)
            .and_then(|previous| self.index.get(previous))
            .map(|(previous_key, _)| previous_key.clone())
    }

    pub fn is_empty(&self) -> bool {
        is_empty(&self.variant)
    }
}
