//! # firebase-database-sync
//!
//! Client-side synchronization core of the Firebase Realtime Database: local query views,
//! optimistic writes and listener event generation, independent of any transport.
//!
//! See the [`database`] module for an overview and an example.

pub mod database;

pub mod util;
