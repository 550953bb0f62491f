//! Low-level primitives the B-tree is built on.
//!
//! These are the collaborators of the tree: byte encodings, the buffer pool,
//! the write-ahead log and the key-lock manager.

/// Byte-level utilities and encoding/decoding.
pub mod bytes;

/// Key locks and transaction handles.
pub mod concurrency;

/// Buffer pool: page fixing, latching and allocation.
pub mod pager;

/// Write-ahead logging of page changes.
pub mod wal;
