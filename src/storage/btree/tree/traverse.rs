use std::cmp::Ordering;

use tracing::trace;

use super::BTree;
use crate::primitives::concurrency::{GapMode, LockMode, LockWait, Xct};
use crate::primitives::pager::{LatchMode, PageHandle};
use crate::storage::btree::key::{KeyCodec, KeyStr};
use crate::storage::btree::page::{BTreePage, LEAF_LEVEL};
use crate::storage::btree::search::{search, search_node, RawPage};
use crate::types::{FosterError, PageId, Result};

/// Upper bound on pages visited by one optimistic probe before it gives up
/// and takes the latched path.
const OPTIMISTIC_MAX_VISITS: usize = 64;

/// A key-lock request.
#[derive(Copy, Clone, Debug)]
pub(crate) struct KeyLock {
    mode: LockMode,
    gap: GapMode,
    transient: bool,
}

impl KeyLock {
    /// Shared lock on an existing key.
    pub(crate) const READ: KeyLock = KeyLock {
        mode: LockMode::Shared,
        gap: GapMode::None,
        transient: false,
    };
    /// Exclusive lock on an existing or newly inserted key.
    pub(crate) const WRITE: KeyLock = KeyLock {
        mode: LockMode::Exclusive,
        gap: GapMode::None,
        transient: false,
    };
    /// Pins the absence of a key.
    pub(crate) const ABSENT: KeyLock = KeyLock {
        mode: LockMode::Shared,
        gap: GapMode::Shared,
        transient: false,
    };
    /// Instant check that no one pinned the gap a new key lands in.
    pub(crate) const INSERT_GAP: KeyLock = KeyLock {
        mode: LockMode::Exclusive,
        gap: GapMode::Exclusive,
        transient: true,
    };
}

enum Step {
    Foster(u32, bool),
    Leaf,
    Child { child: u32, level: u16 },
}

impl BTree {
    /// Descends from the root to the leaf whose fence range holds `key`,
    /// latched in `leaf_mode`. Interior pages are latched shared and
    /// coupled one level at a time.
    pub(crate) fn traverse(&self, key: &[u8], leaf_mode: LatchMode) -> Result<PageHandle> {
        let mut allow_adopt = self.options.adopt_eagerly;
        'restart: loop {
            self.stats.inc_traversals();
            let mut current = self.store.fix(self.root, LatchMode::Shared)?;
            let (root_is_leaf, root_has_foster) = {
                let root = BTreePage::wrap(current.data());
                (root.is_leaf(), root.foster() != 0)
            };
            if root_has_foster {
                drop(current);
                self.grow_tree()?;
                continue 'restart;
            }
            if root_is_leaf && leaf_mode == LatchMode::Exclusive {
                drop(current);
                current = self.store.fix(self.root, LatchMode::Exclusive)?;
                let root = BTreePage::wrap(current.data());
                if !root.is_leaf() || root.foster() != 0 {
                    continue 'restart;
                }
            }
            loop {
                let step = {
                    let page = BTreePage::wrap(current.data());
                    if page.belongs_to_foster(key) {
                        Step::Foster(page.foster(), page.is_leaf())
                    } else if page.is_leaf() {
                        Step::Leaf
                    } else {
                        Step::Child {
                            child: page.child_at(search_node(&page, key)),
                            level: page.level(),
                        }
                    }
                };
                match step {
                    Step::Leaf => return Ok(current),
                    Step::Foster(foster, leaf) => {
                        let mode = if leaf { leaf_mode } else { LatchMode::Shared };
                        let next = current.pid().sibling(foster);
                        trace!(target: "fosterdb::btree::search", from = %current.pid(), to = %next, "foster hop");
                        current = self.store.fix(next, mode)?;
                        self.stats.inc_foster_hops();
                    }
                    Step::Child { child, level } => {
                        let mode = if level == LEAF_LEVEL + 1 {
                            leaf_mode
                        } else {
                            LatchMode::Shared
                        };
                        let child_pid = current.pid().sibling(child);
                        let next = self.store.fix(child_pid, mode)?;
                        let has_foster = BTreePage::wrap(next.data()).foster() != 0;
                        if allow_adopt && has_foster {
                            let parent = current.pid();
                            drop(next);
                            drop(current);
                            if !self.adopt(parent, child_pid)? {
                                allow_adopt = false;
                            }
                            continue 'restart;
                        }
                        current = next;
                    }
                }
            }
        }
    }

    /// Takes a key lock while holding the leaf latch. On conflict the latch
    /// is released, the lock is awaited without it, and the caller is asked
    /// to restart with `LockConflict` (the lock, once granted, is kept).
    pub(crate) fn lock_latched(
        &self,
        xct: &Xct,
        leaf: PageHandle,
        key: &[u8],
        request: KeyLock,
    ) -> Result<PageHandle> {
        if !xct.need_lock() {
            return Ok(leaf);
        }
        let pid = leaf.pid();
        let KeyLock { mode, gap, transient } = request;
        match self
            .locks
            .lock_key_range(xct, pid, key, mode, gap, transient, LockWait::Conditional)
        {
            Ok(()) => Ok(leaf),
            Err(FosterError::LockConflict) => {
                drop(leaf);
                self.locks
                    .lock_key_range(xct, pid, key, mode, gap, transient, LockWait::Unconditional)?;
                Err(FosterError::LockConflict)
            }
            Err(err) => Err(err),
        }
    }

    /// Looks up a key outside any transaction.
    pub fn lookup<K: KeyCodec + ?Sized>(&self, key: &K) -> Result<Option<Vec<u8>>> {
        self.lookup_with(&Xct::system(), key)
    }

    /// Looks up a key, taking a shared lock on it (or on its absence) when
    /// the transaction locks.
    pub fn lookup_with<K: KeyCodec + ?Sized>(&self, xct: &Xct, key: &K) -> Result<Option<Vec<u8>>> {
        let keystr = KeyStr::encode(key);
        self.lookup_keystr(xct, keystr.as_bytes())
    }

    pub(crate) fn lookup_keystr(&self, xct: &Xct, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.retry_on_lock_conflict(|| {
            let leaf = self.traverse(key, LatchMode::Shared)?;
            let found = {
                let page = BTreePage::wrap(leaf.data());
                let hit = search(&page, key);
                (hit.found && !page.is_ghost(hit.slot)).then(|| page.element(hit.slot).to_vec())
            };
            let request = if found.is_some() { KeyLock::READ } else { KeyLock::ABSENT };
            self.lock_latched(xct, leaf, key, request)?;
            Ok(found)
        })
    }

    /// Latch-free lookup over page snapshots with robust search. Falls back
    /// to [`BTree::lookup`] whenever a snapshot is unavailable or does not
    /// describe a coherent path to the key.
    pub fn lookup_optimistic<K: KeyCodec + ?Sized>(&self, key: &K) -> Result<Option<Vec<u8>>> {
        let keystr = KeyStr::encode(key);
        match self.probe_optimistic(keystr.as_bytes())? {
            Some(found) => Ok(found),
            None => {
                trace!(target: "fosterdb::btree::search", "optimistic probe fell back to latched lookup");
                self.lookup_keystr(&Xct::system(), keystr.as_bytes())
            }
        }
    }

    fn probe_optimistic(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        let mut pid = self.root;
        for _ in 0..OPTIMISTIC_MAX_VISITS {
            let Some(image) = self.store.snapshot(pid)? else {
                return Ok(None);
            };
            match probe_snapshot(&image, pid, key) {
                Some(Probe::Next(next)) => pid = next,
                Some(Probe::Done(found)) => return Ok(Some(found)),
                None => return Ok(None),
            }
        }
        Ok(None)
    }
}

enum Probe {
    Next(PageId),
    Done(Option<Vec<u8>>),
}

fn probe_snapshot(image: &[u8], pid: PageId, key: &[u8]) -> Option<Probe> {
    let raw = RawPage::new(image)?;
    match raw.fence_relation(key)? {
        Ordering::Less => None,
        Ordering::Greater => {
            let foster = raw.foster()?;
            (foster != 0).then(|| Probe::Next(pid.sibling(foster)))
        }
        Ordering::Equal => {
            let hit = raw.search(key)?;
            if raw.level()? == LEAF_LEVEL {
                if !hit.found {
                    return Some(Probe::Done(None));
                }
                let element = raw.element(hit.slot)?;
                Some(Probe::Done(element.map(<[u8]>::to_vec)))
            } else {
                let (child, _) = raw.child(hit.node_slot())?;
                (child != 0).then(|| Probe::Next(pid.sibling(child)))
            }
        }
    }
}
