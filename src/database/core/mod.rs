//! Write bookkeeping and the sync tree built on top of it.

pub mod compound_write;
pub mod event_registration;
pub mod listen_provider;
pub mod operation;
pub mod persistence;
pub mod sync_point;
pub mod sync_tree;
pub mod tree;
pub mod write_tree;
