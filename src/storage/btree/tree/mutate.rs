//! Record-level changes: insert, put, update, overwrite and remove.
//!
//! Every operation latches its leaf exclusively, takes key locks for
//! locking transactions, logs one record and applies it. A page without
//! room is first defragmented (ghost reclamation) and otherwise split,
//! after which the loop re-examines whichever half now covers the key.

use tracing::debug;

use super::traverse::KeyLock;
use super::BTree;
use crate::primitives::concurrency::Xct;
use crate::primitives::pager::{LatchMode, PageHandle};
use crate::primitives::wal::LogRecord;
use crate::storage::btree::ghost::{is_enough_spacious_ghost, reclaimable_ghosts, reclaimable_space};
use crate::storage::btree::key::{KeyCodec, KeyStr};
use crate::storage::btree::page::{leaf_record_len, BTreePage, SLOT_LEN};
use crate::storage::btree::search::search;
use crate::storage::btree::split::check_chance_for_norecord_split;
use crate::types::{FosterError, Result};

#[derive(Copy, Clone)]
enum LeafHit {
    Live(usize),
    Ghost(usize),
    Absent,
}

fn probe<B: AsRef<[u8]>>(page: &BTreePage<B>, key: &[u8]) -> LeafHit {
    let hit = search(page, key);
    match (hit.found, hit.found && page.is_ghost(hit.slot)) {
        (false, _) => LeafHit::Absent,
        (true, true) => LeafHit::Ghost(hit.slot),
        (true, false) => LeafHit::Live(hit.slot),
    }
}

/// Extra heap bytes slot `slot` needs to hold an element of `element_len`.
fn growth<B: AsRef<[u8]>>(page: &BTreePage<B>, slot: usize, element_len: usize) -> usize {
    leaf_record_len(page.trunc_key(slot).len(), element_len).saturating_sub(page.item_state(slot + 1).len())
}

impl BTree {
    /// Inserts a new record; fails with `DuplicateKey` if the key is live.
    pub fn insert<K: KeyCodec + ?Sized>(&self, key: &K, element: &[u8]) -> Result<()> {
        self.insert_with(&Xct::system(), key, element)
    }

    /// [`BTree::insert`] on behalf of `xct`.
    pub fn insert_with<K: KeyCodec + ?Sized>(&self, xct: &Xct, key: &K, element: &[u8]) -> Result<()> {
        let keystr = KeyStr::encode(key);
        self.check_entry(keystr.as_bytes(), element)?;
        self.retry_on_lock_conflict(|| self.insert_once(xct, keystr.as_bytes(), element))
    }

    /// Inserts or replaces a record.
    pub fn put<K: KeyCodec + ?Sized>(&self, key: &K, element: &[u8]) -> Result<()> {
        self.put_with(&Xct::system(), key, element)
    }

    /// [`BTree::put`] on behalf of `xct`. A new key first gets a ghost
    /// reserved by a system change, which the transaction then fills.
    pub fn put_with<K: KeyCodec + ?Sized>(&self, xct: &Xct, key: &K, element: &[u8]) -> Result<()> {
        let keystr = KeyStr::encode(key);
        self.check_entry(keystr.as_bytes(), element)?;
        self.retry_on_lock_conflict(|| self.put_once(xct, keystr.as_bytes(), element))
    }

    /// Replaces the element of a live record; `NotFound` otherwise.
    pub fn update<K: KeyCodec + ?Sized>(&self, key: &K, element: &[u8]) -> Result<()> {
        self.update_with(&Xct::system(), key, element)
    }

    /// [`BTree::update`] on behalf of `xct`.
    pub fn update_with<K: KeyCodec + ?Sized>(&self, xct: &Xct, key: &K, element: &[u8]) -> Result<()> {
        let keystr = KeyStr::encode(key);
        self.check_entry(keystr.as_bytes(), element)?;
        self.retry_on_lock_conflict(|| self.update_once(xct, keystr.as_bytes(), element))
    }

    /// Overwrites `bytes` at `offset` of a live record's element without
    /// changing its length.
    pub fn overwrite<K: KeyCodec + ?Sized>(&self, key: &K, offset: usize, bytes: &[u8]) -> Result<()> {
        self.overwrite_with(&Xct::system(), key, offset, bytes)
    }

    /// [`BTree::overwrite`] on behalf of `xct`.
    pub fn overwrite_with<K: KeyCodec + ?Sized>(
        &self,
        xct: &Xct,
        key: &K,
        offset: usize,
        bytes: &[u8],
    ) -> Result<()> {
        let keystr = KeyStr::encode(key);
        let offset_u32 = u32::try_from(offset).map_err(|_| FosterError::Invalid("overwrite offset too large"))?;
        self.retry_on_lock_conflict(|| self.overwrite_once(xct, keystr.as_bytes(), offset_u32, bytes))
    }

    /// Turns a live record into a ghost; `NotFound` if there is none.
    pub fn remove<K: KeyCodec + ?Sized>(&self, key: &K) -> Result<()> {
        self.remove_with(&Xct::system(), key)
    }

    /// [`BTree::remove`] on behalf of `xct`.
    pub fn remove_with<K: KeyCodec + ?Sized>(&self, xct: &Xct, key: &K) -> Result<()> {
        let keystr = KeyStr::encode(key);
        self.retry_on_lock_conflict(|| self.remove_once(xct, keystr.as_bytes()))
    }

    fn check_entry(&self, key: &[u8], element: &[u8]) -> Result<()> {
        let len = key.len() + element.len();
        let max = self.max_entry_size();
        if len > max {
            return Err(FosterError::RecordWontFit { len, max });
        }
        Ok(())
    }

    fn insert_once(&self, xct: &Xct, key: &[u8], element: &[u8]) -> Result<()> {
        let mut leaf = self.traverse(key, LatchMode::Exclusive)?;
        loop {
            let page = BTreePage::wrap(leaf.data());
            match probe(&page, key) {
                LeafHit::Live(_) => {
                    self.lock_latched(xct, leaf, key, KeyLock::READ)?;
                    return Err(FosterError::DuplicateKey);
                }
                LeafHit::Ghost(slot) => {
                    if is_enough_spacious_ghost(&page, slot, element.len()) {
                        return self.fill_ghost(xct, leaf, slot, key, element);
                    }
                    let needed = growth(&page, slot, element.len());
                    if page.free_space() >= needed {
                        return self.fill_ghost(xct, leaf, slot, key, element);
                    }
                    leaf = self.make_room(leaf, key, needed, false)?;
                }
                LeafHit::Absent => {
                    let data_len = leaf_record_len(key.len() - page.prefix_len(), element.len());
                    if self.has_room(&page, data_len) && !self.norecord_chance(&page, key) {
                        leaf = self.lock_latched(xct, leaf, key, KeyLock::INSERT_GAP)?;
                        leaf = self.lock_latched(xct, leaf, key, KeyLock::WRITE)?;
                        let record = LogRecord::InsertNonGhost {
                            page: leaf.pid(),
                            key: key.to_vec(),
                            element: element.to_vec(),
                        };
                        self.log_apply(xct.log_owner(), &record, &mut leaf)?;
                        return Ok(());
                    }
                    leaf = self.make_room(leaf, key, data_len, true)?;
                }
            }
        }
    }

    fn put_once(&self, xct: &Xct, key: &[u8], element: &[u8]) -> Result<()> {
        let mut leaf = self.traverse(key, LatchMode::Exclusive)?;
        loop {
            let page = BTreePage::wrap(leaf.data());
            match probe(&page, key) {
                LeafHit::Live(slot) => {
                    let needed = growth(&page, slot, element.len());
                    if needed == 0 || page.free_space() >= needed {
                        return self.replace_live(xct, leaf, slot, key, element);
                    }
                    leaf = self.make_room(leaf, key, needed, false)?;
                }
                LeafHit::Ghost(slot) => {
                    if is_enough_spacious_ghost(&page, slot, element.len()) {
                        return self.fill_ghost(xct, leaf, slot, key, element);
                    }
                    let needed = growth(&page, slot, element.len());
                    if page.free_space() >= needed {
                        return self.fill_ghost(xct, leaf, slot, key, element);
                    }
                    leaf = self.make_room(leaf, key, needed, false)?;
                }
                LeafHit::Absent => {
                    let data_len = leaf_record_len(key.len() - page.prefix_len(), element.len());
                    if self.has_room(&page, data_len) && !self.norecord_chance(&page, key) {
                        leaf = self.lock_latched(xct, leaf, key, KeyLock::INSERT_GAP)?;
                        leaf = self.lock_latched(xct, leaf, key, KeyLock::WRITE)?;
                        let record = LogRecord::GhostReserve {
                            page: leaf.pid(),
                            key: key.to_vec(),
                            element_len: element.len() as u32,
                        };
                        self.log_apply(None, &record, &mut leaf)?;
                        self.stats.inc_ghost_reserves();
                        continue;
                    }
                    leaf = self.make_room(leaf, key, data_len, true)?;
                }
            }
        }
    }

    pub(super) fn update_once(&self, xct: &Xct, key: &[u8], element: &[u8]) -> Result<()> {
        let mut leaf = self.traverse(key, LatchMode::Exclusive)?;
        loop {
            let page = BTreePage::wrap(leaf.data());
            let LeafHit::Live(slot) = probe(&page, key) else {
                return self.not_found(xct, leaf, key);
            };
            let needed = growth(&page, slot, element.len());
            if needed == 0 || page.free_space() >= needed {
                return self.replace_live(xct, leaf, slot, key, element);
            }
            leaf = self.make_room(leaf, key, needed, false)?;
        }
    }

    pub(super) fn overwrite_once(&self, xct: &Xct, key: &[u8], offset: u32, bytes: &[u8]) -> Result<()> {
        let leaf = self.traverse(key, LatchMode::Exclusive)?;
        let page = BTreePage::wrap(leaf.data());
        let LeafHit::Live(slot) = probe(&page, key) else {
            return self.not_found(xct, leaf, key);
        };
        let current = page.element(slot);
        let start = offset as usize;
        let end = start + bytes.len();
        if end > current.len() {
            return Err(FosterError::RecordWontFit {
                len: end,
                max: current.len(),
            });
        }
        let old = current[start..end].to_vec();
        let mut leaf = self.lock_latched(xct, leaf, key, KeyLock::WRITE)?;
        let record = LogRecord::Overwrite {
            page: leaf.pid(),
            key: key.to_vec(),
            offset,
            old,
            new: bytes.to_vec(),
        };
        self.log_apply(xct.log_owner(), &record, &mut leaf)?;
        Ok(())
    }

    pub(super) fn remove_once(&self, xct: &Xct, key: &[u8]) -> Result<()> {
        let leaf = self.traverse(key, LatchMode::Exclusive)?;
        let page = BTreePage::wrap(leaf.data());
        let LeafHit::Live(_) = probe(&page, key) else {
            return self.not_found(xct, leaf, key);
        };
        let mut leaf = self.lock_latched(xct, leaf, key, KeyLock::WRITE)?;
        let record = LogRecord::GhostMark {
            page: leaf.pid(),
            keys: vec![key.to_vec()],
        };
        self.log_apply(xct.log_owner(), &record, &mut leaf)?;
        self.stats.add_ghost_marks(1);
        Ok(())
    }

    fn fill_ghost(&self, xct: &Xct, leaf: PageHandle, slot: usize, key: &[u8], element: &[u8]) -> Result<()> {
        let prior = BTreePage::wrap(leaf.data()).element(slot).to_vec();
        let mut leaf = self.lock_latched(xct, leaf, key, KeyLock::WRITE)?;
        let record = LogRecord::Insert {
            page: leaf.pid(),
            key: key.to_vec(),
            element: element.to_vec(),
            prior,
        };
        self.log_apply(xct.log_owner(), &record, &mut leaf)?;
        Ok(())
    }

    fn replace_live(&self, xct: &Xct, leaf: PageHandle, slot: usize, key: &[u8], element: &[u8]) -> Result<()> {
        let old = BTreePage::wrap(leaf.data()).element(slot).to_vec();
        let mut leaf = self.lock_latched(xct, leaf, key, KeyLock::WRITE)?;
        let record = LogRecord::Update {
            page: leaf.pid(),
            key: key.to_vec(),
            old,
            new: element.to_vec(),
        };
        self.log_apply(xct.log_owner(), &record, &mut leaf)?;
        Ok(())
    }

    fn not_found<T>(&self, xct: &Xct, leaf: PageHandle, key: &[u8]) -> Result<T> {
        self.lock_latched(xct, leaf, key, KeyLock::ABSENT)?;
        Err(FosterError::NotFound)
    }

    fn norecord_chance<B: AsRef<[u8]>>(&self, page: &BTreePage<B>, key: &[u8]) -> bool {
        check_chance_for_norecord_split(page, key, &self.options.split, self.options.max_records_per_page)
    }

    /// Frees `data_len` bytes on the latched leaf, by reclaiming unlocked
    /// ghosts when that is enough and by splitting otherwise. `new_record`
    /// says whether the caller also needs a slot under the record cap.
    /// A leaf that has room but qualifies for a no-record split ends up
    /// split once its ghosts are gone.
    fn make_room(&self, mut leaf: PageHandle, key: &[u8], data_len: usize, new_record: bool) -> Result<PageHandle> {
        let reclaim = {
            let page = BTreePage::wrap(leaf.data());
            let keys = reclaimable_ghosts(&page, |ghost| ghost == key || self.locks.is_key_locked(ghost, None));
            let freed = reclaimable_space(&page, &keys);
            let slot_cost = if new_record { SLOT_LEN } else { 0 };
            let under_cap = !new_record
                || self
                    .options
                    .max_records_per_page
                    .map_or(true, |cap| page.nrecs() - keys.len() < usize::from(cap));
            (!keys.is_empty() && under_cap && page.free_space() + freed >= data_len + slot_cost)
                .then_some(keys)
        };
        let Some(keys) = reclaim else {
            return self.split_for(leaf, key);
        };
        let record = LogRecord::GhostReclaim {
            page: leaf.pid(),
            keys: keys.iter().map(|k| k.to_vec()).collect(),
        };
        self.log_apply(None, &record, &mut leaf)?;
        self.stats.inc_defrags();
        self.stats.add_ghost_reclaims(keys.len() as u64);
        debug!(
            target: "fosterdb::btree",
            page = %leaf.pid(),
            reclaimed = keys.len(),
            "defragmented leaf"
        );
        Ok(leaf)
    }
}
