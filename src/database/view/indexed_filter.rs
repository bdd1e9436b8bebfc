use serde_json::Value;

use crate::database::path::Path;
use crate::database::query::QueryParams;
use crate::database::variant::{get_child, get_immediate_child, is_empty, is_leaf};
use crate::database::view::change::Change;
use crate::database::view::child_change_accumulator::ChildChangeAccumulator;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::database::view::variant_filter::{CompleteChildSource, VariantFilter};
use crate::util::dev_assert;

/// Keeps every child; only maintains ordering and reports changes.
#[derive(Clone, Debug, Default)]
pub struct IndexedFilter {
    params: QueryParams,
}

impl IndexedFilter {
    pub fn new(params: QueryParams) -> Self {
        Self { params }
    }

    fn reindex(&self, snap: IndexedVariant) -> IndexedVariant {
        if snap.query_params() == &self.params {
            snap
        } else {
            IndexedVariant::with_params(snap.variant().clone(), self.params.clone())
        }
    }
}

impl VariantFilter for IndexedFilter {
    fn update_child(
        &self,
        indexed: &IndexedVariant,
        key: &str,
        new_child: Value,
        affected_path: &Path,
        _source: &dyn CompleteChildSource,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant {
        let old_child = get_immediate_child(indexed.variant(), key);
        if get_child(old_child, affected_path) == get_child(&new_child, affected_path)
            && is_empty(old_child) == is_empty(&new_child)
        {
            return indexed.clone();
        }

        if let Some(accumulator) = accumulator {
            if is_empty(&new_child) {
                if indexed.has_child(key) {
                    accumulator.track_child_change(Change::child_removed(key, old_child.clone()));
                } else {
                    dev_assert(
                        is_leaf(indexed.variant()),
                        "A child remove without an old child only makes sense on a leaf node",
                    );
                }
            } else if is_empty(old_child) {
                accumulator.track_child_change(Change::child_added(key, new_child.clone()));
            } else {
                accumulator.track_child_change(Change::child_changed(
                    key,
                    new_child.clone(),
                    old_child.clone(),
                ));
            }
        }

        if is_leaf(indexed.variant()) && is_empty(&new_child) {
            return indexed.clone();
        }
        self.reindex(indexed.update_child(key, new_child))
    }

    fn update_full_variant(
        &self,
        old_snap: &IndexedVariant,
        new_snap: IndexedVariant,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant {
        if let Some(accumulator) = accumulator {
            for (key, old_child) in old_snap.index() {
                if !new_snap.has_child(key) {
                    accumulator.track_child_change(Change::child_removed(key, old_child.clone()));
                }
            }
            for (key, new_child) in new_snap.index() {
                match old_snap.child(key) {
                    Some(old_child) if old_child != new_child => {
                        accumulator.track_child_change(Change::child_changed(
                            key,
                            new_child.clone(),
                            old_child.clone(),
                        ));
                    }
                    Some(_) => {}
                    None => {
                        accumulator.track_child_change(Change::child_added(key, new_child.clone()));
                    }
                }
            }
        }
        self.reindex(new_snap)
    }

    fn update_priority(&self, old_snap: &IndexedVariant, new_priority: &Value) -> IndexedVariant {
        if old_snap.is_empty() {
            IndexedVariant::with_params(Value::Null, self.params.clone())
        } else {
            old_snap.update_priority(new_priority)
        }
    }

    fn filters_variants(&self) -> bool {
        false
    }

    fn indexed_filter(&self) -> &IndexedFilter {
        self
    }

    fn query_params(&self) -> &QueryParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::view::variant_filter::NoCompleteSource;
    use serde_json::json;

    #[test]
    fn update_child_tracks_each_kind() {
        let filter = IndexedFilter::default();
        let snap = IndexedVariant::new(json!({ "a": 1, "b": 2 }));
        let mut acc = ChildChangeAccumulator::new();
        let snap = filter.update_child(&snap, "a", json!(5), &Path::root(), &NoCompleteSource, Some(&mut acc));
        let snap = filter.update_child(&snap, "b", Value::Null, &Path::root(), &NoCompleteSource, Some(&mut acc));
        let snap = filter.update_child(&snap, "c", json!(3), &Path::root(), &NoCompleteSource, Some(&mut acc));
        assert_eq!(snap.variant(), &json!({ "a": 5, "c": 3 }));
        assert_eq!(
            acc.into_changes(),
            vec![
                Change::child_changed("a", json!(5), json!(1)),
                Change::child_removed("b", json!(2)),
                Change::child_added("c", json!(3)),
            ]
        );
    }

    #[test]
    fn unchanged_child_is_a_no_op() {
        let filter = IndexedFilter::default();
        let snap = IndexedVariant::new(json!({ "a": { "x": 1, "y": 2 } }));
        let mut acc = ChildChangeAccumulator::new();
        let same = filter.update_child(
            &snap,
            "a",
            json!({ "x": 1, "y": 3 }),
            &Path::new("x"),
            &NoCompleteSource,
            Some(&mut acc),
        );
        assert_eq!(same, snap);
        assert!(acc.is_empty());
    }

    #[test]
    fn full_update_diffs_children() {
        let filter = IndexedFilter::default();
        let old = IndexedVariant::new(json!({ "a": 1, "b": 2 }));
        let new = IndexedVariant::new(json!({ "b": 3, "c": 4 }));
        let mut acc = ChildChangeAccumulator::new();
        let result = filter.update_full_variant(&old, new.clone(), Some(&mut acc));
        assert_eq!(result, new);
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn priority_on_empty_snap_stays_empty() {
        let filter = IndexedFilter::default();
        let empty = IndexedVariant::default();
        assert!(filter.update_priority(&empty, &json!(1)).is_empty());
        let leaf = IndexedVariant::new(json!("x"));
        assert_eq!(
            filter.update_priority(&leaf, &json!(1)).variant(),
            &json!({ ".value": "x", ".priority": 1 })
        );
    }
}
