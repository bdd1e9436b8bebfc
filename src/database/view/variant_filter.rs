//! Filters decide which children a view keeps and record what changed.
//!
//! Every view owns one filter chosen from its params: an [`IndexedFilter`]
//! when the query loads all data, a [`RangedFilter`] for start/end bounds,
//! and a [`LimitedFilter`] when a limit applies.

use std::fmt::Debug;

use serde_json::Value;

use crate::database::core::write_tree::IterationDirection;
use crate::database::path::Path;
use crate::database::query::QueryParams;
use crate::database::view::child_change_accumulator::ChildChangeAccumulator;
use crate::database::view::indexed_variant::IndexedVariant;

pub use crate::database::view::indexed_filter::IndexedFilter;
pub use crate::database::view::limited_filter::LimitedFilter;
pub use crate::database::view::ranged_filter::RangedFilter;

/// Supplies children a filter needs but the view does not hold, for
/// instance the next child that slides into a limited window.
pub trait CompleteChildSource {
    fn complete_child(&self, key: &str) -> Option<Value>;

    fn child_after_child(
        &self,
        params: &QueryParams,
        child: &(String, Value),
        direction: IterationDirection,
    ) -> Option<(String, Value)>;
}

/// A source that never knows anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCompleteSource;

impl CompleteChildSource for NoCompleteSource {
    fn complete_child(&self, _key: &str) -> Option<Value> {
        None
    }

    fn child_after_child(
        &self,
        _params: &QueryParams,
        _child: &(String, Value),
        _direction: IterationDirection,
    ) -> Option<(String, Value)> {
        None
    }
}

pub trait VariantFilter: Debug + Send + Sync {
    /// Updates one child. `affected_path` is the location below the child
    /// that actually changed and lets the filter skip no-op updates.
    fn update_child(
        &self,
        indexed: &IndexedVariant,
        key: &str,
        new_child: Value,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant;

    fn update_full_variant(
        &self,
        old_snap: &IndexedVariant,
        new_snap: IndexedVariant,
        accumulator: Option<&mut ChildChangeAccumulator>,
    ) -> IndexedVariant;

    fn update_priority(&self, old_snap: &IndexedVariant, new_priority: &Value) -> IndexedVariant;

    /// Whether this filter may drop children.
    fn filters_variants(&self) -> bool;

    /// The filter that only orders, without excluding anything.
    fn indexed_filter(&self) -> &IndexedFilter;

    fn query_params(&self) -> &QueryParams;
}

pub fn variant_filter_from_query_params(params: &QueryParams) -> Box<dyn VariantFilter> {
    if params.loads_all_data() {
        Box::new(IndexedFilter::new(params.clone()))
    } else if params.limit().is_some() {
        Box::new(LimitedFilter::new(params.clone()))
    } else {
        Box::new(RangedFilter::new(params.clone()))
    }
}
