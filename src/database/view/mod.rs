//! Per-query caches, the filters that shape them and the events they raise.

pub mod change;
pub mod child_change_accumulator;
pub mod event;
pub mod event_generator;
pub mod indexed_filter;
pub mod indexed_variant;
pub mod limited_filter;
pub mod ranged_filter;
pub mod variant_filter;
pub mod view;
pub mod view_cache;
pub mod view_processor;
