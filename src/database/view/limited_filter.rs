use std::cmp::Ordering;

use serde_json::Value;

use crate::database::comparator::{Post, QueryParamsComparator};
use crate::database::core::write_tree::IterationDirection;
use crate::database::path::Path;
use crate::database::query::{QueryLimit, QueryParams};
use crate::database::variant::{is_empty, is_leaf};
use crate::database::view::change::Change;
use crate::database::view::child_change_accumulator::ChildChangeAccumulator;
use crate::database::view::indexed_filter::IndexedFilter;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::database::view::ranged_filter::RangedFilter;
use crate::database::view::variant_filter::{CompleteChildSource, VariantFilter};

/// A ranged filter that additionally keeps at most `limit` children, counted
/// from the start (`limit_to_first`) or from the end (`limit_to_last`).
///
/// When a child leaves a full window, the next child outside it is pulled in
/// through the [`CompleteChildSource`].
#[derive(Clone, Debug)]
pub struct LimitedFilter {
    ranged_filter: RangedFilter,
    limit: usize,
    reverse: bool,
}

fn track(accumulator: &mut Option<&mut ChildChangeAccumulator>, change: Change) {
    if let Some(accumulator) = accumulator.as_deref_mut() {
        accumulator.track_child_change(change);
    }
}

impl LimitedFilter {
    pub fn new(params: QueryParams) -> Self {
        let (limit, reverse) = match params.limit() {
            Some(QueryLimit::First(count)) => (count as usize, false),
            Some(QueryLimit::Last(count)) => (count as usize, true),
            None => (usize::MAX, false),
        };
        Self {
            ranged_filter: RangedFilter::new(params),
            limit,
            reverse,
        }
    }

    fn direction(&self) -> IterationDirection {
        if self.reverse {
            IterationDirection::Reverse
        } else {
            IterationDirection::Forward
        }
    }

    /// Orders in window direction: "less" is closer to the anchored end.
    fn directed(&self, ordering: Ordering) -> Ordering {
        if self.reverse {
            ordering.reverse()
        } else {
            ordering
        }
    }

    fn full_limit_update_child(
        &self,
        old_indexed: &IndexedVariant,
        child_key: &str,
        child_snap: Value,
        source: &dyn CompleteChildSource,
        mut accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant {
        let boundary = if self.reverse {
            old_indexed.first_child()
        } else {
            old_indexed.last_child()
        };
        let Some(window_boundary) = boundary.cloned() else {
            return old_indexed.clone();
        };
        let params = self.query_params();
        let comparator = QueryParamsComparator::new(params);
        let in_range = self.ranged_filter.matches(child_key, &child_snap);

        if let Some(old_child) = old_indexed.child(child_key).cloned() {
            let mut next_child =
                source.child_after_child(params, &window_boundary, self.direction());
            // Children already in the window, or the one being updated, may
            // show up here while a merge is only partially applied.
            loop {
                match &next_child {
                    Some(next) if next.0 == child_key || old_indexed.has_child(&next.0) => {
                        let advanced = source.child_after_child(params, next, self.direction());
                        next_child = advanced;
                    }
                    _ => break,
                }
            }
            let compare_next = next_child
                .as_ref()
                .map(|(next_key, next_value)| {
                    self.directed(comparator.compare(next_key, next_value, child_key, &child_snap))
                })
                .unwrap_or(Ordering::Greater);
            let remains_in_window =
                in_range && !is_empty(&child_snap) && compare_next != Ordering::Less;
            if remains_in_window {
                track(
                    &mut accumulator,
                    Change::child_changed(child_key, child_snap.clone(), old_child),
                );
                return old_indexed.update_child(child_key, child_snap);
            }
            track(&mut accumulator, Change::child_removed(child_key, old_child));
            let new_indexed = old_indexed.update_child(child_key, Value::Null);
            match next_child {
                Some((next_key, next_value))
                    if self.ranged_filter.matches(&next_key, &next_value) =>
                {
                    track(
                        &mut accumulator,
                        Change::child_added(&next_key, next_value.clone()),
                    );
                    new_indexed.update_child(&next_key, next_value)
                }
                _ => new_indexed,
            }
        } else if is_empty(&child_snap) {
            // Deleting a node outside the window.
            old_indexed.clone()
        } else if in_range {
            let (boundary_key, boundary_value) = window_boundary;
            let displaces = self.directed(comparator.compare(
                &boundary_key,
                &boundary_value,
                child_key,
                &child_snap,
            )) != Ordering::Less;
            if displaces {
                track(
                    &mut accumulator,
                    Change::child_removed(&boundary_key, boundary_value),
                );
                track(
                    &mut accumulator,
                    Change::child_added(child_key, child_snap.clone()),
                );
                old_indexed
                    .update_child(child_key, child_snap)
                    .update_child(&boundary_key, Value::Null)
            } else {
                old_indexed.clone()
            }
        } else {
            old_indexed.clone()
        }
    }
}

impl VariantFilter for LimitedFilter {
    fn update_child(
        &self,
        indexed: &IndexedVariant,
        key: &str,
        new_child: Value,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant {
        let new_child = if self.ranged_filter.matches(key, &new_child) {
            new_child
        } else {
            Value::Null
        };
        if indexed.child(key) == Some(&new_child) {
            return indexed.clone();
        }
        if indexed.child_count() < self.limit {
            self.ranged_filter.indexed_filter().update_child(
                indexed,
                key,
                new_child,
                affected_path,
                source,
                accumulator,
            )
        } else {
            self.full_limit_update_child(indexed, key, new_child, source, accumulator)
        }
    }

    fn update_full_variant(
        &self,
        old_snap: &IndexedVariant,
        new_snap: IndexedVariant,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant {
        let filtered = if is_leaf(new_snap.variant()) || is_empty(new_snap.variant()) {
            IndexedVariant::with_params(Value::Null, self.query_params().clone())
        } else {
            let comparator = QueryParamsComparator::new(self.query_params());
            let (start, end) = if self.reverse {
                (self.ranged_filter.end_post(), self.ranged_filter.start_post())
            } else {
                (self.ranged_filter.start_post(), self.ranged_filter.end_post())
            };
            let ordered: Vec<&(String, Value)> = if self.reverse {
                new_snap.index().iter().rev().collect()
            } else {
                new_snap.index().iter().collect()
            };
            let mut filtered = new_snap.update_priority(&Value::Null);
            let mut count = 0;
            let mut found_start = false;
            for (key, child) in ordered {
                let next = Post::node(key.clone(), child.clone());
                if !found_start
                    && self.directed(comparator.compare_posts(start, &next)) != Ordering::Greater
                {
                    found_start = true;
                }
                let in_range = found_start
                    && count < self.limit
                    && self.directed(comparator.compare_posts(&next, end)) != Ordering::Greater;
                if in_range {
                    count += 1;
                } else {
                    filtered = filtered.update_child(key, Value::Null);
                }
            }
            filtered
        };
        self.ranged_filter
            .indexed_filter()
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
        self.ranged_filter.indexed_filter()
    }

    fn query_params(&self) -> &QueryParams {
        self.ranged_filter.query_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::view::variant_filter::NoCompleteSource;
    use serde_json::json;

    /// Serves children of a fixed complete node.
    struct FixedSource {
        data: IndexedVariant,
    }

    impl CompleteChildSource for FixedSource {
        fn complete_child(&self, key: &str) -> Option<Value> {
            self.data.child(key).cloned()
        }

        fn child_after_child(
            &self,
            params: &QueryParams,
            child: &(String, Value),
            direction: IterationDirection,
        ) -> Option<(String, Value)> {
            let comparator = QueryParamsComparator::new(params);
            let mut candidates = self.data.index().iter().filter(|(key, value)| {
                let ordering = comparator.compare(key, value, &child.0, &child.1);
                match direction {
                    IterationDirection::Forward => ordering == Ordering::Greater,
                    IterationDirection::Reverse => ordering == Ordering::Less,
                }
            });
            match direction {
                IterationDirection::Forward => candidates.next().cloned(),
                IterationDirection::Reverse => candidates.last().cloned(),
            }
        }
    }

    fn first(count: u32) -> LimitedFilter {
        LimitedFilter::new(
            QueryParams::new()
                .order_by_value()
                .and_then(|p| p.limit_to_first(count))
                .unwrap(),
        )
    }

    fn keys(indexed: &IndexedVariant) -> Vec<&str> {
        indexed.index().iter().map(|(key, _)| key.as_str()).collect()
    }

    #[test]
    fn full_update_keeps_first_children() {
        let filter = first(2);
        let params = filter.query_params().clone();
        let new = IndexedVariant::with_params(json!({ "a": 3, "b": 1, "c": 2 }), params.clone());
        let result = filter.update_full_variant(&IndexedVariant::with_params(Value::Null, params), new, None);
        assert_eq!(keys(&result), vec!["b", "c"]);
    }

    #[test]
    fn full_update_keeps_last_children() {
        let filter = LimitedFilter::new(
            QueryParams::new()
                .order_by_value()
                .and_then(|p| p.limit_to_last(2))
                .unwrap(),
        );
        let params = filter.query_params().clone();
        let new = IndexedVariant::with_params(json!({ "a": 3, "b": 1, "c": 2 }), params.clone());
        let result = filter.update_full_variant(&IndexedVariant::with_params(Value::Null, params), new, None);
        assert_eq!(keys(&result), vec!["c", "a"]);
    }

    #[test]
    fn smaller_child_displaces_window_boundary() {
        let filter = first(2);
        let params = filter.query_params().clone();
        let window = IndexedVariant::with_params(json!({ "b": 1, "c": 2 }), params);
        let mut acc = ChildChangeAccumulator::new();
        let result = filter.update_child(
            &window,
            "z",
            json!(0),
            &Path::root(),
            &NoCompleteSource,
            Some(&mut acc),
        );
        assert_eq!(keys(&result), vec!["z", "b"]);
        assert_eq!(
            acc.into_changes(),
            vec![
                Change::child_removed("c", json!(2)),
                Change::child_added("z", json!(0)),
            ]
        );
    }

    #[test]
    fn larger_child_is_ignored_when_full() {
        let filter = first(2);
        let params = filter.query_params().clone();
        let window = IndexedVariant::with_params(json!({ "b": 1, "c": 2 }), params);
        let result = filter.update_child(&window, "z", json!(9), &Path::root(), &NoCompleteSource, None);
        assert_eq!(result, window);
    }

    #[test]
    fn removed_child_pulls_in_next() {
        let filter = first(2);
        let params = filter.query_params().clone();
        let window = IndexedVariant::with_params(json!({ "b": 1, "c": 2 }), params.clone());
        let source = FixedSource {
            data: IndexedVariant::with_params(json!({ "b": 1, "c": 2, "d": 3 }), params),
        };
        let mut acc = ChildChangeAccumulator::new();
        let result = filter.update_child(&window, "b", Value::Null, &Path::root(), &source, Some(&mut acc));
        assert_eq!(keys(&result), vec!["c", "d"]);
        assert_eq!(
            acc.into_changes(),
            vec![
                Change::child_removed("b", json!(1)),
                Change::child_added("d", json!(3)),
            ]
        );
    }
}
