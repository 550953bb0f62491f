#![forbid(unsafe_code)]
//! Key-lock manager and transaction handles.
//!
//! Locks are named by full keystr bytes. A lock on an absent key pins its
//! absence: a later insert of the same key by another transaction conflicts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::trace;

use crate::types::{FosterError, PageId, Result, TxnId};

/// Mode of a key lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Readers.
    Shared,
    /// Writers.
    Exclusive,
}

impl LockMode {
    fn compatible(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// Mode of the gap component of a key-range lock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GapMode {
    /// Key only.
    None,
    /// Key plus a shared gap.
    Shared,
    /// Key plus an exclusive gap.
    Exclusive,
}

impl GapMode {
    fn compatible(self, other: GapMode) -> bool {
        !matches!(
            (self, other),
            (GapMode::Exclusive, GapMode::Shared | GapMode::Exclusive)
                | (GapMode::Shared, GapMode::Exclusive)
        )
    }
}

/// Whether a lock request may wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockWait {
    /// Fail immediately with a conflict.
    Conditional,
    /// Wait up to the manager's timeout.
    Unconditional,
}

/// A transaction as seen by the B-tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Xct {
    id: TxnId,
    need_lock: bool,
}

impl Xct {
    /// A user transaction.
    pub const fn new(id: TxnId, need_lock: bool) -> Self {
        Self { id, need_lock }
    }

    /// The system transaction used for structural changes and
    /// compensation; never locks and is never rolled back.
    pub const fn system() -> Self {
        Self {
            id: TxnId(0),
            need_lock: false,
        }
    }

    /// Transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// True for [`Xct::system`].
    pub fn is_system(&self) -> bool {
        self.id.0 == 0
    }

    /// Whether key locks are taken on behalf of this transaction.
    pub fn need_lock(&self) -> bool {
        self.need_lock
    }

    /// Owner recorded in log records.
    pub fn log_owner(&self) -> Option<TxnId> {
        (!self.is_system()).then_some(self.id)
    }
}

/// Lock manager contract used by the B-tree.
pub trait LockManager: Send + Sync {
    /// Locks `key` in `mode` for the transaction.
    fn lock_key(
        &self,
        xct: &Xct,
        page: PageId,
        key: &[u8],
        mode: LockMode,
        wait: LockWait,
    ) -> Result<()>;

    /// Locks `key` plus its gap. A transient request only checks that the
    /// lock could be granted and records nothing.
    #[allow(clippy::too_many_arguments)]
    fn lock_key_range(
        &self,
        xct: &Xct,
        page: PageId,
        key: &[u8],
        mode: LockMode,
        gap: GapMode,
        transient: bool,
        wait: LockWait,
    ) -> Result<()>;

    /// Drops every lock the transaction holds.
    fn release_all(&self, txn: TxnId);

    /// True when any transaction other than `except` holds a lock on `key`.
    fn is_key_locked(&self, key: &[u8], except: Option<TxnId>) -> bool;
}

/// Lock manager that grants everything.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoLocks;

impl LockManager for NoLocks {
    fn lock_key(&self, _: &Xct, _: PageId, _: &[u8], _: LockMode, _: LockWait) -> Result<()> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn lock_key_range(
        &self,
        _: &Xct,
        _: PageId,
        _: &[u8],
        _: LockMode,
        _: GapMode,
        _: bool,
        _: LockWait,
    ) -> Result<()> {
        Ok(())
    }

    fn release_all(&self, _: TxnId) {}

    fn is_key_locked(&self, _: &[u8], _: Option<TxnId>) -> bool {
        false
    }
}

#[derive(Copy, Clone, Debug)]
struct Holder {
    txn: TxnId,
    mode: LockMode,
    gap: GapMode,
}

#[derive(Default)]
struct Table {
    entries: HashMap<Vec<u8>, SmallVec<[Holder; 2]>>,
    owned: HashMap<TxnId, Vec<Vec<u8>>>,
}

impl Table {
    fn grantable(&self, txn: TxnId, key: &[u8], mode: LockMode, gap: GapMode) -> bool {
        self.entries.get(key).map_or(true, |holders| {
            holders
                .iter()
                .filter(|h| h.txn != txn)
                .all(|h| h.mode.compatible(mode) && h.gap.compatible(gap))
        })
    }

    fn grant(&mut self, txn: TxnId, key: &[u8], mode: LockMode, gap: GapMode) {
        let holders = self.entries.entry(key.to_vec()).or_default();
        match holders.iter_mut().find(|h| h.txn == txn) {
            Some(held) => {
                if mode == LockMode::Exclusive {
                    held.mode = LockMode::Exclusive;
                }
                if gap == GapMode::Exclusive || held.gap == GapMode::None {
                    held.gap = gap;
                }
            }
            None => {
                holders.push(Holder { txn, mode, gap });
                self.owned.entry(txn).or_default().push(key.to_vec());
            }
        }
    }
}

/// Blocking key-lock table keyed by keystr bytes.
pub struct KeyLockTable {
    table: Mutex<Table>,
    released: Condvar,
    timeout: Duration,
}

impl KeyLockTable {
    /// Unconditional requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Number of locks held by `txn`.
    pub fn held_by(&self, txn: TxnId) -> usize {
        self.table.lock().owned.get(&txn).map_or(0, Vec::len)
    }

    #[allow(clippy::too_many_arguments)]
    fn acquire(
        &self,
        xct: &Xct,
        page: PageId,
        key: &[u8],
        mode: LockMode,
        gap: GapMode,
        transient: bool,
        wait: LockWait,
    ) -> Result<()> {
        if !xct.need_lock() {
            return Ok(());
        }
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();
        loop {
            if table.grantable(xct.id(), key, mode, gap) {
                if !transient {
                    table.grant(xct.id(), key, mode, gap);
                }
                return Ok(());
            }
            trace!(
                target: "fosterdb::lock",
                page = %page,
                txn = xct.id().0,
                ?mode,
                ?wait,
                "key lock conflict"
            );
            if wait == LockWait::Conditional
                || self.released.wait_until(&mut table, deadline).timed_out()
            {
                return Err(FosterError::LockConflict);
            }
        }
    }
}

impl LockManager for KeyLockTable {
    fn lock_key(
        &self,
        xct: &Xct,
        page: PageId,
        key: &[u8],
        mode: LockMode,
        wait: LockWait,
    ) -> Result<()> {
        self.acquire(xct, page, key, mode, GapMode::None, false, wait)
    }

    #[allow(clippy::too_many_arguments)]
    fn lock_key_range(
        &self,
        xct: &Xct,
        page: PageId,
        key: &[u8],
        mode: LockMode,
        gap: GapMode,
        transient: bool,
        wait: LockWait,
    ) -> Result<()> {
        self.acquire(xct, page, key, mode, gap, transient, wait)
    }

    fn release_all(&self, txn: TxnId) {
        let mut table = self.table.lock();
        let Some(keys) = table.owned.remove(&txn) else {
            return;
        };
        for key in keys {
            if let Some(holders) = table.entries.get_mut(&key) {
                holders.retain(|h| h.txn != txn);
                if holders.is_empty() {
                    table.entries.remove(&key);
                }
            }
        }
        drop(table);
        self.released.notify_all();
    }

    fn is_key_locked(&self, key: &[u8], except: Option<TxnId>) -> bool {
        self.table
            .lock()
            .entries
            .get(key)
            .map_or(false, |holders| holders.iter().any(|h| Some(h.txn) != except))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const PAGE: PageId = PageId::new(1, 1);

    fn user(id: u64) -> Xct {
        Xct::new(TxnId(id), true)
    }

    #[test]
    fn shared_locks_stack_exclusive_conflicts() -> Result<()> {
        let locks = KeyLockTable::new(Duration::from_millis(10));
        locks.lock_key(&user(1), PAGE, b"k", LockMode::Shared, LockWait::Conditional)?;
        locks.lock_key(&user(2), PAGE, b"k", LockMode::Shared, LockWait::Conditional)?;
        assert!(matches!(
            locks.lock_key(&user(3), PAGE, b"k", LockMode::Exclusive, LockWait::Unconditional),
            Err(FosterError::LockConflict)
        ));
        assert!(locks.is_key_locked(b"k", Some(TxnId(1))));
        locks.release_all(TxnId(1));
        locks.release_all(TxnId(2));
        assert!(!locks.is_key_locked(b"k", None));
        locks.lock_key(&user(3), PAGE, b"k", LockMode::Exclusive, LockWait::Conditional)?;
        assert_eq!(locks.held_by(TxnId(3)), 1);
        Ok(())
    }

    #[test]
    fn transient_range_lock_records_nothing() -> Result<()> {
        let locks = KeyLockTable::new(Duration::from_millis(10));
        let xct = user(1);
        locks.lock_key_range(
            &xct,
            PAGE,
            b"k",
            LockMode::Exclusive,
            GapMode::Exclusive,
            true,
            LockWait::Conditional,
        )?;
        assert_eq!(locks.held_by(TxnId(1)), 0);
        locks.lock_key_range(
            &user(2),
            PAGE,
            b"k",
            LockMode::Shared,
            GapMode::Shared,
            false,
            LockWait::Conditional,
        )?;
        assert!(locks
            .lock_key_range(
                &xct,
                PAGE,
                b"k",
                LockMode::Exclusive,
                GapMode::Exclusive,
                true,
                LockWait::Conditional,
            )
            .is_err());
        Ok(())
    }

    #[test]
    fn system_transaction_never_locks() -> Result<()> {
        let locks = KeyLockTable::new(Duration::from_millis(10));
        locks.lock_key(&user(1), PAGE, b"k", LockMode::Exclusive, LockWait::Conditional)?;
        locks.lock_key(&Xct::system(), PAGE, b"k", LockMode::Exclusive, LockWait::Conditional)?;
        assert_eq!(Xct::system().log_owner(), None);
        Ok(())
    }

    #[test]
    fn waiter_wakes_on_release() -> Result<()> {
        let locks = Arc::new(KeyLockTable::new(Duration::from_secs(5)));
        locks.lock_key(&user(1), PAGE, b"k", LockMode::Exclusive, LockWait::Conditional)?;
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks.lock_key(&user(2), PAGE, b"k", LockMode::Exclusive, LockWait::Unconditional)
            })
        };
        thread::sleep(Duration::from_millis(20));
        locks.release_all(TxnId(1));
        assert!(waiter.join().map_err(|_| FosterError::Invalid("waiter panicked"))?.is_ok());
        Ok(())
    }
}
