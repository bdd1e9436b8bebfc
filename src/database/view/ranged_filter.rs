use std::cmp::Ordering;

use serde_json::Value;

use crate::database::comparator::{Post, QueryParamsComparator};
use crate::database::path::Path;
use crate::database::query::QueryParams;
use crate::database::variant::is_leaf;
use crate::database::view::child_change_accumulator::ChildChangeAccumulator;
use crate::database::view::indexed_filter::IndexedFilter;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::database::view::variant_filter::{CompleteChildSource, VariantFilter};

/// Keeps the children whose position lies between the query's start and end
/// posts, both inclusive.
#[derive(Clone, Debug)]
pub struct RangedFilter {
    indexed_filter: IndexedFilter,
    start_post: Post,
    end_post: Post,
}

impl RangedFilter {
    pub fn new(params: QueryParams) -> Self {
        Self {
            start_post: params.start_post(),
            end_post: params.end_post(),
            indexed_filter: IndexedFilter::new(params),
        }
    }

    pub fn start_post(&self) -> &Post {
        &self.start_post
    }

    pub fn end_post(&self) -> &Post {
        &self.end_post
    }

    pub fn matches(&self, key: &str, value: &Value) -> bool {
        let comparator = QueryParamsComparator::new(self.query_params());
        let node = Post::node(key, value.clone());
        comparator.compare_posts(&self.start_post, &node) != Ordering::Greater
            && comparator.compare_posts(&node, &self.end_post) != Ordering::Greater
    }
}

impl VariantFilter for RangedFilter {
    fn update_child(
        &self,
        indexed: &IndexedVariant,
        key: &str,
        new_child: Value,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant {
        let new_child = if self.matches(key, &new_child) {
            new_child
        } else {
            Value::Null
        };
        self.indexed_filter
            .update_child(indexed, key, new_child, affected_path, source, accumulator)
    }

    fn update_full_variant(
        &self,
        old_snap: &IndexedVariant,
        new_snap: IndexedVariant,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant {
        let filtered = if is_leaf(new_snap.variant()) {
            IndexedVariant::with_params(Value::Null, self.query_params().clone())
        } else {
            let mut filtered = new_snap.update_priority(&Value::Null);
            for (key, child) in new_snap.index() {
                if !self.matches(key, child) {
                    filtered = filtered.update_child(key, Value::Null);
                }
            }
            filtered
        };
        self.indexed_filter
            .update_full_variant(old_snap, filtered, accumulator)
    }

    /// Queries ignore priorities on the filtered node itself.
    fn update_priority(&self, old_snap: &IndexedVariant, _new_priority: &Value) -> IndexedVariant {
        old_snap.clone()
    }

    fn filters_variants(&self) -> bool {
        true
    }

    fn indexed_filter(&self) -> &IndexedFilter {
        &self.indexed_filter
    }

    fn query_params(&self) -> &QueryParams {
        self.indexed_filter.query_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::query::QueryBound;
    use crate::database::view::variant_filter::NoCompleteSource;
    use serde_json::json;

    fn between(start: i64, end: i64) -> RangedFilter {
        let params = QueryParams::new()
            .order_by_value()
            .and_then(|p| p.start_at(QueryBound::new(json!(start))))
            .and_then(|p| p.end_at(QueryBound::new(json!(end))))
            .unwrap();
        RangedFilter::new(params)
    }

    #[test]
    fn bounds_are_inclusive() {
        let filter = between(2, 4);
        assert!(!filter.matches("a", &json!(1)));
        assert!(filter.matches("b", &json!(2)));
        assert!(filter.matches("d", &json!(4)));
        assert!(!filter.matches("e", &json!(5)));
    }

    #[test]
    fn full_update_drops_out_of_range_children() {
        let filter = between(2, 4);
        let params = filter.query_params().clone();
        let new = IndexedVariant::with_params(json!({ "a": 1, "b": 3, "c": 9 }), params.clone());
        let mut acc = ChildChangeAccumulator::new();
        let result = filter.update_full_variant(
            &IndexedVariant::with_params(Value::Null, params),
            new,
            Some(&mut acc),
        );
        assert_eq!(result.variant(), &json!({ "b": 3 }));
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn out_of_range_child_update_removes_it() {
        let filter = between(2, 4);
        let params = filter.query_params().clone();
        let snap = IndexedVariant::with_params(json!({ "b": 3 }), params);
        let updated = filter.update_child(&snap, "b", json!(7), &Path::root(), &NoCompleteSource, None);
        assert!(updated.is_empty());
    }
}
