use serde_json::Value;

use crate::database::core::event_registration::{EventRegistration, ListenerId};
use crate::database::core::operation::{Operation, OperationKind};
use crate::database::core::write_tree::WriteTreeRef;
use crate::database::error::DatabaseError;
use crate::database::path::Path;
use crate::database::query::QuerySpec;
use crate::database::variant::{get_internal_variant, variant_hash};
use crate::database::view::change::Change;
use crate::database::view::event::Event;
use crate::database::view::event_generator::generate_events_for_changes;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::database::view::variant_filter::{
    variant_filter_from_query_params, IndexedFilter, VariantFilter,
};
use crate::database::view::view_cache::{CacheNode, ViewCache};
use crate::database::view::view_processor::ViewProcessor;
use crate::util::dev_assert;

/// The cached, filtered data of one query plus the registrations listening
/// to it.
#[derive(Debug)]
pub struct View {
    query_spec: QuerySpec,
    view_processor: ViewProcessor,
    view_cache: ViewCache,
    event_registrations: Vec<EventRegistration>,
}

impl View {
    pub fn new(query_spec: QuerySpec, initial_view_cache: ViewCache) -> Self {
        let params = &query_spec.params;
        let index_filter = IndexedFilter::new(params.clone());
        let filter = variant_filter_from_query_params(params);
        let initial_server_cache = initial_view_cache.server_snap();
        let initial_event_cache = initial_view_cache.local_snap();

        // The server data only gets the query's own filter once a tagged
        // listen delivers it.
        let empty = IndexedVariant::with_params(Value::Null, params.clone());
        let server_snap = index_filter.update_full_variant(
            &empty,
            IndexedVariant::with_params(initial_server_cache.variant().clone(), params.clone()),
            None,
        );
        let local_snap = filter.update_full_variant(
            &empty,
            IndexedVariant::with_params(initial_event_cache.variant().clone(), params.clone()),
            None,
        );

        let view_cache = ViewCache::new(
            CacheNode::new(
                local_snap,
                initial_event_cache.fully_initialized(),
                filter.filters_variants(),
            ),
            CacheNode::new(
                server_snap,
                initial_server_cache.fully_initialized(),
                index_filter.filters_variants(),
            ),
        );
        Self {
            view_processor: ViewProcessor::new(filter),
            query_spec,
            view_cache,
            event_registrations: Vec::new(),
        }
    }

    pub fn query_spec(&self) -> &QuerySpec {
        &self.query_spec
    }

    pub fn view_cache(&self) -> &ViewCache {
        &self.view_cache
    }

    pub fn server_cache(&self) -> &Value {
        self.view_cache.server_snap().variant()
    }

    pub fn local_cache(&self) -> &Value {
        self.view_cache.local_snap().variant()
    }

    /// Hash of the server data, sent along with a listen so the server can
    /// skip resending data the client already has.
    pub fn server_cache_hash(&self) -> String {
        variant_hash(self.server_cache())
    }

    /// Complete server data at `path` below this view. A view that filters
    /// can still answer for a specific child.
    pub fn complete_server_cache(&self, path: &Path) -> Option<&Value> {
        let snap = self.view_cache.complete_server_snap()?;
        if self.query_spec.loads_all_data() || !path.is_empty() {
            get_internal_variant(snap, path)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.event_registrations.is_empty()
    }

    pub fn event_registrations(&self) -> &[EventRegistration] {
        &self.event_registrations
    }

    pub fn add_event_registration(&mut self, registration: EventRegistration) {
        self.event_registrations.push(registration);
    }

    /// Removes the registration of `listener`, or every registration when
    /// `listener` is `None`. With a `cancel_error` every registration moves
    /// into a cancel event instead.
    pub fn remove_event_registration(
        &mut self,
        listener: Option<ListenerId>,
        cancel_error: Option<&DatabaseError>,
    ) -> Vec<Event> {
        if let Some(error) = cancel_error {
            dev_assert(
                listener.is_none(),
                "A cancel should cancel all event registrations",
            );
            let path = self.query_spec.path.clone();
            return self
                .event_registrations
                .drain(..)
                .map(|registration| Event::cancel(registration, error.clone(), path.clone()))
                .collect();
        }

        match listener {
            Some(listener_id) => {
                if let Some(position) = self
                    .event_registrations
                    .iter()
                    .position(|registration| registration.matches_listener(listener_id))
                {
                    let removed = self.event_registrations.remove(position);
                    removed.status().mark_removed();
                }
            }
            None => {
                for removed in self.event_registrations.drain(..) {
                    removed.status().mark_removed();
                }
            }
        }
        Vec::new()
    }

    /// Applies `operation` and returns the events for the registrations of
    /// this view, along with the raw changes.
    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_server_cache: Option<&Value>,
    ) -> (Vec<Event>, Vec<Change>) {
        if matches!(operation.kind, OperationKind::Merge { .. })
            && operation.source.query_params.is_none()
        {
            dev_assert(
                self.view_cache.complete_server_snap().is_some(),
                "We should always have a full cache before handling merges",
            );
            dev_assert(
                self.view_cache.complete_local_snap().is_some(),
                "Missing event cache, even though we have a server cache",
            );
        }

        let (new_view_cache, changes) = self.view_processor.apply_operation(
            &self.view_cache,
            operation,
            writes_cache,
            opt_complete_server_cache,
        );
        dev_assert(
            new_view_cache.server_snap().fully_initialized()
                || !self.view_cache.server_snap().fully_initialized(),
            "Once a server snap is complete, it should never go back",
        );
        self.view_cache = new_view_cache;

        let events = generate_events_for_changes(
            &self.query_spec,
            &changes,
            self.view_cache.local_snap().indexed_variant(),
            &self.event_registrations,
        );
        (events, changes)
    }

    /// Events that bring a newly added `registration` up to date; other
    /// registrations of this view receive nothing.
    pub fn initial_events(&self, registration: &EventRegistration) -> Vec<Event> {
        let local_snap = self.view_cache.local_snap();
        let mut initial_changes: Vec<Change> = local_snap
            .indexed_variant()
            .index()
            .iter()
            .map(|(key, child)| Change::child_added(key, child.clone()))
            .collect();
        if local_snap.fully_initialized() {
            initial_changes.push(Change::value(local_snap.variant().clone()));
        }
        generate_events_for_changes(
            &self.query_spec,
            &initial_changes,
            local_snap.indexed_variant(),
            std::slice::from_ref(registration),
        )
    }
}
