//! # Firebase Realtime Database sync core
//!
//! This module ports the client-side synchronization engine of the Firebase Realtime Database
//! desktop SDK to Rust.
//!
//! It keeps a local, query-aware cache of the data the app listens to, layers the app's pending
//! writes over what the server confirmed, and computes the ordered listener events every change
//! produces. Transport, disk storage and the public reference API live outside of this module and
//! plug in through the [`PersistenceManager`] and [`ListenProvider`] traits.
//!
//! ## Features
//!
//! - [`SyncTree`] as the single entry point for user writes, server data, acknowledgements and
//!   listener registration
//! - Filtered views (`start_at`/`end_at`/`equal_to`/`limit_to_*` under any ordering) with
//!   `child_added`/`child_removed`/`child_changed`/`child_moved`/`value` events in a fixed order
//! - Listen shadowing: locations under a complete listen do not start their own server listen
//! - Tagged server operations addressed to a single filtered listen
//! - Optimistic writes reverted or confirmed on acknowledgement, with server value resolution
//!   (`server_timestamp`, `increment`)
//! - In-memory persistence of the server cache and tracked queries
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use firebase_database_sync::database::{
//!     DataSnapshot, DatabaseError, EventRegistration, ListenerId, NoopListenProvider,
//!     NoopPersistenceManager, Path, QuerySpec, SyncTree, ValueListener,
//! };
//! use serde_json::json;
//!
//! struct PrintValue;
//!
//! impl ValueListener for PrintValue {
//!     fn on_value_changed(&self, snapshot: &DataSnapshot) {
//!         println!("{} = {}", snapshot.path(), snapshot.value());
//!     }
//!
//!     fn on_cancelled(&self, error: &DatabaseError) {
//!         println!("cancelled: {error}");
//!     }
//! }
//!
//! let mut tree = SyncTree::new(Box::new(NoopPersistenceManager), Box::new(NoopListenProvider));
//! let query = QuerySpec::new(Path::new("rooms/lobby"));
//! tree.add_event_registration(EventRegistration::value(
//!     query,
//!     ListenerId::next(),
//!     Arc::new(PrintValue),
//! ));
//!
//! for event in tree.apply_server_overwrite(&Path::new("rooms/lobby"), json!({ "topic": "rust" })) {
//!     event.fire();
//! }
//! ```
//!
//! DISCLAIMER: This is not an official Firebase product, nor it is guaranteed that it has no bugs
//! or that it will work as intended.

pub mod comparator;
pub mod core;
pub mod error;
pub mod path;
pub mod query;
pub mod server_value;
pub mod snapshot;
pub mod variant;
pub mod view;

pub use self::core::event_registration::{
    ChildListener, EventRegistration, EventTarget, ListenerId, ValueListener,
};
pub use self::core::listen_provider::{ListenProvider, NoopListenProvider, Tag};
pub use self::core::operation::AckStatus;
pub use self::core::persistence::{
    InMemoryPersistenceManager, NoopPersistenceManager, PersistenceManager, ServerCacheUpdate,
};
pub use self::core::sync_tree::{SyncTree, SyncTreeConfig};
pub use self::core::write_tree::{OverwriteVisibility, WriteId};
pub use error::{DatabaseError, DatabaseErrorCode, DatabaseResult};
pub use path::Path;
pub use query::{QueryBound, QueryParams, QuerySpec};
pub use server_value::{increment, server_timestamp};
pub use snapshot::DataSnapshot;
pub use view::change::EventType;
pub use view::event::Event;
