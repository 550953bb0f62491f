//! Storage structures built on the page, log and lock primitives.

/// The foster B-tree.
pub mod btree;
