use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::database::core::event_registration::{EventRegistration, ListenerId};
use crate::database::core::operation::Operation;
use crate::database::core::persistence::PersistenceManager;
use crate::database::core::write_tree::WriteTreeRef;
use crate::database::error::DatabaseError;
use crate::database::path::Path;
use crate::database::query::{QueryParams, QuerySpec};
use crate::database::variant::{children, get_value};
use crate::database::view::change::EventType;
use crate::database::view::event::Event;
use crate::database::view::indexed_variant::IndexedVariant;
use crate::database::view::view::View;
use crate::database::view::view_cache::{CacheNode, ViewCache};
use crate::util::assert;

/// All views active at one location, keyed by their query parameters.
#[derive(Debug, Default)]
pub struct SyncPoint {
    views: BTreeMap<QueryParams, View>,
}

/// What removing registrations from a sync point left behind.
#[derive(Debug, Default)]
pub struct RemovedRegistrations {
    pub events: Vec<Event>,
    /// Queries whose last registration went away. The default query appears
    /// only when the last view loading all data was dropped.
    pub removed_queries: Vec<QuerySpec>,
}

impl SyncPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    /// Applies `operation` to the view it targets, or to every view when it
    /// is not addressed to a single query.
    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        writes_cache: &WriteTreeRef<'_>,
        opt_complete_server_cache: Option<&Value>,
        persistence: &dyn PersistenceManager,
    ) -> Vec<Event> {
        match &operation.source.query_params {
            Some(params) => match self.views.get_mut(params) {
                Some(view) => apply_operation_to_view(
                    view,
                    operation,
                    writes_cache,
                    opt_complete_server_cache,
                    persistence,
                ),
                None => {
                    assert(false, "Tagged operation for a query without a view");
                    Vec::new()
                }
            },
            None => self
                .views
                .values_mut()
                .flat_map(|view| {
                    apply_operation_to_view(
                        view,
                        operation,
                        writes_cache,
                        opt_complete_server_cache,
                        persistence,
                    )
                })
                .collect(),
        }
    }

    /// Adds `registration` to the view for its query, creating the view from
    /// `server_cache` and the pending writes when needed, and returns the
    /// initial events for the new registration.
    pub fn add_event_registration(
        &mut self,
        registration: EventRegistration,
        writes_cache: &WriteTreeRef<'_>,
        server_cache: &CacheNode,
        persistence: &dyn PersistenceManager,
    ) -> Vec<Event> {
        let query_spec = registration.query_spec().clone();
        if !self.views.contains_key(&query_spec.params) {
            let (event_cache, event_cache_complete) =
                match writes_cache.calc_complete_event_cache(server_cache.complete_variant()) {
                    Some(cache) => (cache, true),
                    None => (
                        writes_cache.calc_complete_event_children(server_cache.variant()),
                        false,
                    ),
                };
            let view_cache = ViewCache::new(
                CacheNode::new(
                    IndexedVariant::with_params(event_cache, query_spec.params.clone()),
                    event_cache_complete,
                    false,
                ),
                server_cache.clone(),
            );
            let view = View::new(query_spec.clone(), view_cache);

            if !query_spec.loads_all_data() {
                let keys: BTreeSet<String> = children(get_value(view.local_cache()))
                    .map(|(key, _)| key.clone())
                    .collect();
                persistence.set_tracked_query_keys(&query_spec, &keys);
            }
            self.views.insert(query_spec.params.clone(), view);
        }

        let Some(view) = self.views.get_mut(&query_spec.params) else {
            return Vec::new();
        };
        let events = view.initial_events(&registration);
        view.add_event_registration(registration);
        events
    }

    /// Removes the registration of `listener` (every registration when
    /// `None`). A default `query_spec` searches every view at this location.
    pub fn remove_event_registration(
        &mut self,
        query_spec: &QuerySpec,
        listener: Option<ListenerId>,
        cancel_error: Option<&DatabaseError>,
    ) -> RemovedRegistrations {
        let mut removed = RemovedRegistrations::default();
        let had_complete_view = self.has_complete_view();

        if query_spec.is_default() {
            let mut emptied = Vec::new();
            for (params, view) in self.views.iter_mut() {
                removed
                    .events
                    .extend(view.remove_event_registration(listener, cancel_error));
                if view.is_empty() {
                    if !view.query_spec().loads_all_data() {
                        removed.removed_queries.push(view.query_spec().clone());
                    }
                    emptied.push(params.clone());
                }
            }
            for params in emptied {
                self.views.remove(&params);
            }
        } else if let Some(view) = self.views.get_mut(&query_spec.params) {
            removed
                .events
                .extend(view.remove_event_registration(listener, cancel_error));
            if view.is_empty() {
                if !query_spec.loads_all_data() {
                    removed.removed_queries.push(query_spec.clone());
                }
                self.views.remove(&query_spec.params);
            }
        }

        if had_complete_view && !self.has_complete_view() {
            removed.removed_queries.push(query_spec.default_form());
        }
        removed
    }

    /// Views whose query filters the data.
    pub fn incomplete_query_views(&self) -> Vec<&View> {
        self.views
            .values()
            .filter(|view| !view.query_spec().loads_all_data())
            .collect()
    }

    /// Complete server data at `path` from the first view able to serve it.
    pub fn complete_server_cache(&self, path: &Path) -> Option<&Value> {
        self.views
            .values()
            .find_map(|view| view.complete_server_cache(path))
    }

    /// The view serving `query_spec`. Any view loading all data serves a
    /// query loading all data.
    pub fn view_for_query(&self, query_spec: &QuerySpec) -> Option<&View> {
        if query_spec.loads_all_data() {
            self.complete_view()
        } else {
            self.views.get(&query_spec.params)
        }
    }

    pub fn view_exists_for_query(&self, query_spec: &QuerySpec) -> bool {
        self.view_for_query(query_spec).is_some()
    }

    pub fn has_complete_view(&self) -> bool {
        self.complete_view().is_some()
    }

    pub fn complete_view(&self) -> Option<&View> {
        self.views
            .values()
            .find(|view| view.query_spec().loads_all_data())
    }
}

fn apply_operation_to_view(
    view: &mut View,
    operation: &Operation,
    writes_cache: &WriteTreeRef<'_>,
    opt_complete_server_cache: Option<&Value>,
    persistence: &dyn PersistenceManager,
) -> Vec<Event> {
    let (events, changes) = view.apply_operation(operation, writes_cache, opt_complete_server_cache);
    if !view.query_spec().loads_all_data() {
        let mut added = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for change in &changes {
            match change.event_type {
                EventType::ChildAdded => {
                    added.insert(change.child_key.clone());
                }
                EventType::ChildRemoved => {
                    removed.insert(change.child_key.clone());
                }
                _ => {}
            }
        }
        if !added.is_empty() || !removed.is_empty() {
            persistence.update_tracked_query_keys(view.query_spec(), &added, &removed);
        }
    }
    events
}
