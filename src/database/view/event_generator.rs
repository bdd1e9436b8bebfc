//! Turns the changes of one view operation into ordered listener events.
//!
//! Events are grouped by type (removed, added, moved, changed, value) and
//! each group is sorted under the view's ordering, so listeners always see
//! removals before additions and children in their final sort order.

use std::cmp::Ordering;

use crate::database::comparator::QueryParamsComparator;
use crate::database::core::event_registration::EventRegistration;
use crate::database::path::Path;
use crate::database::query::{QueryIndex, QueryParams, QuerySpec};
use crate::database::variant::{get_child, get_priority, variants_are_equivalent};
use crate::database::view::change::{Change, EventType};
use crate::database::view::event::Event;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::util::dev_assert;

const EVENT_ORDER: [EventType; 5] = [
    EventType::ChildRemoved,
    EventType::ChildAdded,
    EventType::ChildMoved,
    EventType::ChildChanged,
    EventType::Value,
];

/// Whether a change of `old` into `new` can move the child under `params`.
fn indexed_value_changed(params: &QueryParams, change: &Change) -> bool {
    let old = &change.old_variant;
    let new = &change.variant;
    match &params.index {
        QueryIndex::Priority => !variants_are_equivalent(get_priority(old), get_priority(new)),
        QueryIndex::Child(child) => {
            let path = Path::new(child);
            QueryParamsComparator::compare_values(get_child(old, &path), get_child(new, &path))
                != Ordering::Equal
        }
        QueryIndex::Value => !variants_are_equivalent(old, new),
        QueryIndex::Key => false,
    }
}

/// Builds the events for `changes` and every registration in
/// `registrations` that responds to them. `event_cache` is the view data
/// after the changes were applied and provides previous sibling keys.
pub fn generate_events_for_changes(
    query_spec: &QuerySpec,
    changes: &[Change],
    event_cache: &IndexedVariant,
    registrations: &[EventRegistration],
) -> Vec<Event> {
    let params = &query_spec.params;
    dev_assert(
        changes
            .iter()
            .filter(|change| change.event_type == EventType::Value)
            .count()
            <= 1,
        "Only one value event may be generated per operation",
    );

    let moves: Vec<Change> = changes
        .iter()
        .filter(|change| {
            change.event_type == EventType::ChildChanged && indexed_value_changed(params, change)
        })
        .map(|change| Change::child_moved(&change.child_key, change.variant.clone()))
        .collect();

    let comparator = QueryParamsComparator::new(params);
    let mut events = Vec::new();
    for event_type in EVENT_ORDER {
        let mut filtered: Vec<&Change> = changes
            .iter()
            .chain(moves.iter())
            .filter(|change| change.event_type == event_type)
            .collect();
        if event_type.is_child_event() {
            filtered.sort_by(|a, b| {
                comparator.compare(&a.child_key, &a.variant, &b.child_key, &b.variant)
            });
        }
        for change in filtered {
            generate_events_for_type(
                &mut events,
                query_spec,
                change,
                event_cache,
                registrations,
            );
        }
    }
    events
}

fn generate_events_for_type(
    events: &mut Vec<Event>,
    query_spec: &QuerySpec,
    change: &Change,
    event_cache: &IndexedVariant,
    registrations: &[EventRegistration],
) {
    if change.event_type.is_child_event() {
        dev_assert(
            !change.child_key.is_empty(),
            "Child changes must carry a child key",
        );
    }
    let materialized = if matches!(
        change.event_type,
        EventType::ChildAdded | EventType::ChildChanged | EventType::ChildMoved
    ) {
        change.clone().with_prev_name(
            event_cache.predecessor_child_name(&change.child_key, &change.variant),
        )
    } else {
        change.clone()
    };
    for registration in registrations {
        if registration.responds_to(materialized.event_type) {
            events.push(registration.generate_event(&materialized, query_spec));
        }
    }
}
