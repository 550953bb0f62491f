#![forbid(unsafe_code)]

//! Foster B-tree over fixed-size slotted pages.
//!
//! Pages carry fence keys and an optional foster child, so a split touches
//! only the page being split and its new sibling. Parents learn about the
//! new page later, through adoption. Every page change goes through the
//! write-ahead log and the shared [`redo::apply`].

/// Keystr encoding and typed key codecs.
pub mod key;
/// Slotted page layout and in-page record operations.
pub mod page;
/// Binary search within a page, latched and robust.
pub mod search;
/// Page (re)formatting and record stealing.
pub mod format;
/// Ghost record lifecycle.
pub mod ghost;
/// Split-point selection and page-level structural changes.
pub mod split;
/// Log record application and recovery.
pub mod redo;

mod cursor;
mod stats;
mod tree;

pub use cursor::Cursor;
pub use key::{KeyCodec, KeyDecode, KeyStr};
pub use redo::RedoReport;
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{BTree, StorageEnv, VerifyReport};

#[cfg(test)]
mod tests;
