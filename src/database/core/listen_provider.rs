use std::fmt;

use crate::database::query::QuerySpec;
use crate::database::view::view::View;

/// Identifies a filtered listen on the wire so the server can address data
/// to that single query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscribes the connection to server data. The sync tree decides what to
/// listen to; the provider only moves the request over the wire.
pub trait ListenProvider: Send + Sync {
    /// `view` exposes the cached data, e.g. its hash, for the request.
    fn start_listening(&self, query_spec: &QuerySpec, tag: Option<Tag>, view: &View);

    fn stop_listening(&self, query_spec: &QuerySpec, tag: Option<Tag>);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListenProvider;

impl ListenProvider for NoopListenProvider {
    fn start_listening(&self, _query_spec: &QuerySpec, _tag: Option<Tag>, _view: &View) {}

    fn stop_listening(&self, _query_spec: &QuerySpec, _tag: Option<Tag>) {}
}
