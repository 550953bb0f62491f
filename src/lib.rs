//! FosterDB: a page-level foster B-tree storage engine.
//!
//! The tree lives in [`storage::btree`]; it runs against the buffer pool,
//! write-ahead log and lock manager in [`primitives`], configured through
//! [`config::BTreeOptions`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;

pub use config::{BTreeOptions, SplitTuning};
pub use storage::btree::{BTree, Cursor, KeyCodec, KeyDecode, RedoReport, StorageEnv, VerifyReport};
pub use types::{FosterError, Lsn, PageId, Result, TxnId};
