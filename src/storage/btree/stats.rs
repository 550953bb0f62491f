use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of foster B-tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BTreeStatsSnapshot {
    /// Root-to-leaf descents started
    pub traversals: u64,
    /// Foster pointers followed during descents
    pub foster_hops: u64,
    /// Foster splits performed, including no-record splits
    pub splits: u64,
    /// Splits that moved no records (100/0)
    pub norecord_splits: u64,
    /// Foster children adopted by their real parent
    pub adopts: u64,
    /// Times the root was pushed down a level
    pub grows: u64,
    /// Ghost slots reserved ahead of an insert
    pub ghost_reserves: u64,
    /// Live records turned into ghosts
    pub ghost_marks: u64,
    /// Ghost records physically removed
    pub ghost_reclaims: u64,
    /// Page defragmentations
    pub defrags: u64,
    /// Operations restarted after a lock or latch conflict
    pub lock_retries: u64,
    /// Log records re-applied during redo
    pub redo_applied: u64,
    /// Log records skipped during redo because the page was newer
    pub redo_skipped: u64,
}

/// Thread-safe statistics tracking for foster B-tree operations.
#[derive(Default)]
pub struct BTreeStats {
    traversals: AtomicU64,
    foster_hops: AtomicU64,
    splits: AtomicU64,
    norecord_splits: AtomicU64,
    adopts: AtomicU64,
    grows: AtomicU64,
    ghost_reserves: AtomicU64,
    ghost_marks: AtomicU64,
    ghost_reclaims: AtomicU64,
    defrags: AtomicU64,
    lock_retries: AtomicU64,
    redo_applied: AtomicU64,
    redo_skipped: AtomicU64,
}

impl BTreeStats {
    /// Returns the number of descents started.
    pub fn traversals(&self) -> u64 {
        self.traversals.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of foster pointers followed.
    pub fn foster_hops(&self) -> u64 {
        self.foster_hops.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of foster splits.
    pub fn splits(&self) -> u64 {
        self.splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of no-record splits.
    pub fn norecord_splits(&self) -> u64 {
        self.norecord_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of adoptions.
    pub fn adopts(&self) -> u64 {
        self.adopts.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of root growths.
    pub fn grows(&self) -> u64 {
        self.grows.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of retries after conflicts.
    pub fn lock_retries(&self) -> u64 {
        self.lock_retries.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_traversals(&self) {
        self.traversals.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_foster_hops(&self) {
        self.foster_hops.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_splits(&self, norecord: bool) {
        self.splits.fetch_add(1, AtomicOrdering::Relaxed);
        if norecord {
            self.norecord_splits.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn inc_adopts(&self) {
        self.adopts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_grows(&self) {
        self.grows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_ghost_reserves(&self) {
        self.ghost_reserves.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_ghost_marks(&self, n: u64) {
        self.ghost_marks.fetch_add(n, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_ghost_reclaims(&self, n: u64) {
        self.ghost_reclaims.fetch_add(n, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_defrags(&self) {
        self.defrags.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_lock_retries(&self) {
        self.lock_retries.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_redo(&self, applied: u64, skipped: u64) {
        self.redo_applied.fetch_add(applied, AtomicOrdering::Relaxed);
        self.redo_skipped.fetch_add(skipped, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(AtomicOrdering::Relaxed);
        BTreeStatsSnapshot {
            traversals: load(&self.traversals),
            foster_hops: load(&self.foster_hops),
            splits: load(&self.splits),
            norecord_splits: load(&self.norecord_splits),
            adopts: load(&self.adopts),
            grows: load(&self.grows),
            ghost_reserves: load(&self.ghost_reserves),
            ghost_marks: load(&self.ghost_marks),
            ghost_reclaims: load(&self.ghost_reclaims),
            defrags: load(&self.defrags),
            lock_retries: load(&self.lock_retries),
            redo_applied: load(&self.redo_applied),
            redo_skipped: load(&self.redo_skipped),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "fosterdb::btree::stats",
            traversals = snapshot.traversals,
            foster_hops = snapshot.foster_hops,
            splits = snapshot.splits,
            norecord_splits = snapshot.norecord_splits,
            adopts = snapshot.adopts,
            grows = snapshot.grows,
            ghost_reserves = snapshot.ghost_reserves,
            ghost_marks = snapshot.ghost_marks,
            ghost_reclaims = snapshot.ghost_reclaims,
            defrags = snapshot.defrags,
            lock_retries = snapshot.lock_retries,
            redo_applied = snapshot.redo_applied,
            redo_skipped = snapshot.redo_skipped,
            "btree stats snapshot"
        );
    }
}
