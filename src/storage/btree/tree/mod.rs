//! The foster B-tree: traversal, record operations, structural
//! modifications, transactions and verification over the page store, log
//! and lock manager collaborators.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use super::format::{format, FormatParams};
use super::key::KeyStr;
use super::page::{max_entry_size, BTreePage};
use super::redo::{apply, redo_all, RedoReport};
use super::stats::{BTreeStats, BTreeStatsSnapshot};
use crate::config::BTreeOptions;
use crate::primitives::concurrency::{KeyLockTable, LockManager};
use crate::primitives::pager::{LatchMode, MemPool, PageAllocator, PageHandle, PageStore};
use crate::primitives::wal::{LogRecord, LogSink, MemoryLog};
use crate::types::{FosterError, Lsn, PageId, Result, TxnId};

mod mutate;
mod smo;
mod traverse;
mod txn;
mod verify;

pub use verify::VerifyReport;

/// The collaborators a tree runs against.
#[derive(Clone)]
pub struct StorageEnv {
    /// Buffer pool.
    pub store: Arc<dyn PageStore>,
    /// Free-page allocator.
    pub alloc: Arc<dyn PageAllocator>,
    /// Write-ahead log.
    pub log: Arc<dyn LogSink>,
    /// Key-lock manager.
    pub locks: Arc<dyn LockManager>,
}

impl StorageEnv {
    /// Wires a memory pool (as both store and allocator), a log and a lock
    /// manager together.
    pub fn new(pool: Arc<MemPool>, log: Arc<dyn LogSink>, locks: Arc<dyn LockManager>) -> Self {
        Self {
            store: Arc::clone(&pool) as Arc<dyn PageStore>,
            alloc: pool,
            log,
            locks,
        }
    }

    /// A fresh in-memory environment sized from `options`.
    pub fn in_memory(vol: u32, options: &BTreeOptions) -> Result<Self> {
        let timeout = Duration::from_millis(options.lock_wait_ms);
        let pool = MemPool::new(vol, options.page_size as usize)?.with_latch_timeout(timeout);
        Ok(Self::new(
            Arc::new(pool),
            Arc::new(MemoryLog::new()),
            Arc::new(KeyLockTable::new(timeout)),
        ))
    }
}

/// A foster B-tree rooted at a fixed page.
pub struct BTree {
    store: Arc<dyn PageStore>,
    alloc: Arc<dyn PageAllocator>,
    log: Arc<dyn LogSink>,
    locks: Arc<dyn LockManager>,
    root: PageId,
    options: BTreeOptions,
    stats: Arc<BTreeStats>,
    next_txn: AtomicU64,
}

impl BTree {
    /// Allocates and formats an empty root leaf covering every key.
    pub fn create(env: StorageEnv, options: BTreeOptions) -> Result<Self> {
        options.validate()?;
        if env.store.page_size() != options.page_size as usize {
            return Err(FosterError::Config(format!(
                "store page size {} does not match configured {}",
                env.store.page_size(),
                options.page_size
            )));
        }
        let root = env.alloc.allocate_page()?;
        let mut image = BTreePage::wrap(vec![0u8; env.store.page_size()]);
        let low = KeyStr::neg_infinity();
        let high = KeyStr::pos_infinity();
        format(
            &mut image,
            &FormatParams::leaf(root, root.page, low.as_bytes(), high.as_bytes()),
        )?;
        let tree = Self::open(env, root, options)?;
        let record = LogRecord::PageImageFormat {
            page: root,
            image: image.into_inner(),
        };
        let mut handle = tree.store.fix(root, LatchMode::Exclusive)?;
        tree.log_apply(None, &record, &mut handle)?;
        info!(target: "fosterdb::btree", root = %root, "created foster b-tree");
        Ok(tree)
    }

    /// Attaches to an existing tree.
    pub fn open(env: StorageEnv, root: PageId, options: BTreeOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            store: env.store,
            alloc: env.alloc,
            log: env.log,
            locks: env.locks,
            root,
            options,
            stats: Arc::new(BTreeStats::default()),
            next_txn: AtomicU64::new(1),
        })
    }

    /// Replays the log from `from` into the store, then attaches.
    pub fn recover(env: StorageEnv, root: PageId, options: BTreeOptions, from: Lsn) -> Result<(Self, RedoReport)> {
        let report = redo_all(env.store.as_ref(), env.log.as_ref(), from, options.split.skew_clamp)?;
        let tree = Self::open(env, root, options)?;
        tree.stats.add_redo(report.applied, report.skipped);
        Ok((tree, report))
    }

    /// Root page id.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Active options.
    pub fn options(&self) -> &BTreeOptions {
        &self.options
    }

    /// Largest `key + element` accepted, in encoded bytes.
    pub fn max_entry_size(&self) -> usize {
        max_entry_size(self.store.page_size())
    }

    /// Access the live statistics counters for this tree.
    pub fn stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Snapshot the current statistics counters.
    pub fn stats_snapshot(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Emit the current statistics to the tracing sink.
    pub fn emit_stats(&self) {
        self.stats.emit_tracing();
    }

    /// Runs `op`, restarting it after retryable lock conflicts.
    pub(crate) fn retry_on_lock_conflict<T>(&self, op: impl FnMut() -> Result<T>) -> Result<T> {
        retry_on_lock_conflict(self.options.max_lock_retries, &self.stats, op)
    }

    /// Logs `record` on behalf of `owner` and applies it to the latched page.
    pub(crate) fn log_apply(
        &self,
        owner: Option<TxnId>,
        record: &LogRecord,
        handle: &mut PageHandle,
    ) -> Result<Lsn> {
        let lsn = self.log.append(owner, record)?;
        self.apply_logged(record, lsn, handle)?;
        Ok(lsn)
    }

    /// Applies an already logged record to one of the pages it touches.
    pub(crate) fn apply_logged(&self, record: &LogRecord, lsn: Lsn, handle: &mut PageHandle) -> Result<()> {
        let pid = handle.pid();
        apply(record, pid, handle.data_mut()?, lsn, self.options.split.skew_clamp)?;
        trace!(
            target: "fosterdb::btree",
            page = %pid,
            lsn = lsn.0,
            kind = record.kind_name(),
            "applied"
        );
        self.check_page(handle.data())
    }

    /// Page self-check after a change, in debug builds, with the
    /// `btree-verify` feature, or when `verify_on_write` is set.
    pub(crate) fn check_page(&self, page: &[u8]) -> Result<()> {
        if cfg!(any(debug_assertions, feature = "btree-verify")) || self.options.verify_on_write {
            if let Err(err) = BTreePage::wrap(page).check_invariants() {
                tracing::error!(target: "fosterdb::btree", error = %err, "page self-check failed");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Room for one more item of `data_len` bytes, honouring the record cap.
    pub(crate) fn has_room<B: AsRef<[u8]>>(&self, page: &BTreePage<B>, data_len: usize) -> bool {
        let under_cap = self
            .options
            .max_records_per_page
            .map_or(true, |cap| page.nrecs() < usize::from(cap));
        under_cap && page.check_space_for_insert(data_len)
    }

    fn next_txn_id(&self) -> TxnId {
        TxnId(self.next_txn.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// Bounded restart loop: `LockConflict` re-runs `op`, anything else is
/// returned as is. Gives up with `RetryExhausted` after `max_retries`.
pub(crate) fn retry_on_lock_conflict<T>(
    max_retries: u32,
    stats: &BTreeStats,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(FosterError::LockConflict) if attempt < max_retries => {
                attempt += 1;
                stats.inc_lock_retries();
                debug!(target: "fosterdb::btree", attempt, "restarting after lock conflict");
            }
            Err(FosterError::LockConflict) => return Err(FosterError::RetryExhausted(max_retries)),
            other => return other,
        }
    }
}
