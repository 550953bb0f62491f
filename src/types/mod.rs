#![forbid(unsafe_code)]
//! Identifiers, error type and on-disk page header shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod checksum;
pub mod page;

/// Physical page identity: volume id plus page number within the volume.
///
/// Page number 0 is reserved as the null pointer, so a stored child or
/// foster pointer of 0 means "none".
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct PageId {
    /// Volume the page belongs to.
    pub vol: u32,
    /// Page number inside the volume.
    pub page: u32,
}

impl PageId {
    /// Builds a page id from its parts.
    pub const fn new(vol: u32, page: u32) -> Self {
        Self { vol, page }
    }

    /// Returns true when the page number is the null pointer.
    pub const fn is_null(self) -> bool {
        self.page == 0
    }

    /// Resolves a stored page number against this page's volume.
    pub const fn sibling(self, page: u32) -> Self {
        Self {
            vol: self.vol,
            page,
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.vol, self.page)
    }
}

/// Log sequence number. Monotonic per log; 0 means "never written".
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The LSN of a page that has never been logged.
    pub const ZERO: Lsn = Lsn(0);
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum FosterError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Bytes on a page or in the log failed structural validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument the engine cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Insert found a live record with the same key.
    #[error("duplicate key")]
    DuplicateKey,
    /// Target key is absent or only present as a ghost.
    #[error("not found")]
    NotFound,
    /// Record is larger than the maximum entry size, or an overwrite
    /// reaches past the end of the existing element.
    #[error("record of {len} bytes does not fit (max {max})")]
    RecordWontFit {
        /// Size requested by the caller.
        len: usize,
        /// Largest size the page format can hold.
        max: usize,
    },
    /// A latch or key lock could not be granted; the operation restarts.
    #[error("lock conflict")]
    LockConflict,
    /// The retry loop gave up after the configured number of conflicts.
    #[error("gave up after {0} lock-conflict retries")]
    RetryExhausted(u32),
    /// The buffer pool has no frame for the page.
    #[error("page {0} not present in buffer pool")]
    PageNotFound(PageId),
    /// Configuration could not be parsed or is out of range.
    #[error("config: {0}")]
    Config(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FosterError>;
