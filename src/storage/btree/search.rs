//! Slot search over a B-tree page.
//!
//! The trusted variant runs on latched pages through [`BTreePage`]. The
//! robust variant runs over arbitrary bytes (an unlatched snapshot) and
//! reports `None` instead of reading out of bounds when the bytes do not
//! describe a coherent page.

use std::cmp::Ordering;

use super::key::{extract_poor_man_key, PoorKey};
use super::page::{
    cmp_prefixed, BTreePage, LEAF_LEVEL, LEAF_RECORD_OVERHEAD, NODE_RECORD_OVERHEAD,
    PAYLOAD_HEADER_LEN, SLOT_LEN,
};
use crate::types::page::PAGE_HDR_LEN;
use crate::types::Lsn;

/// Outcome of a slot search.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SearchResult {
    /// True when `slot` holds the key (live or ghost).
    pub found: bool,
    /// Exact match or insertion point.
    pub slot: usize,
}

impl SearchResult {
    /// Child-pointer slot: the last key `<=` the search key, `-1` for `pid0`.
    pub fn node_slot(self) -> isize {
        if self.found {
            self.slot as isize
        } else {
            self.slot as isize - 1
        }
    }
}

/// Orders the record key against the search key using the poor-man's key
/// before touching record bytes.
#[inline]
fn probe(slot_poor: PoorKey, poor: PoorKey, trunc: impl FnOnce() -> Ordering) -> Ordering {
    match slot_poor.cmp(&poor) {
        Ordering::Equal => trunc(),
        other => other,
    }
}

/// Binary search for a full (prefix-included) keystr on a latched page.
pub fn search<B: AsRef<[u8]>>(page: &BTreePage<B>, key: &[u8]) -> SearchResult {
    let nrecs = page.nrecs();
    if nrecs == 0 {
        return SearchResult { found: false, slot: 0 };
    }
    let prefix = page.prefix_len();
    debug_assert!(key.len() >= prefix && key[..prefix] == *page.prefix());
    let suffix = key.get(prefix..).unwrap_or_default();
    let poor = extract_poor_man_key(suffix);
    let cmp = |slot: usize| probe(page.poor(slot), poor, || page.trunc_key(slot).cmp(suffix));

    // Appends are the common case; check the last slot first.
    match cmp(nrecs - 1) {
        Ordering::Less => return SearchResult { found: false, slot: nrecs },
        Ordering::Equal => return SearchResult { found: true, slot: nrecs - 1 },
        Ordering::Greater => {}
    }
    lower_bound(nrecs - 1, cmp)
}

/// Interior-page search: slot of the last key `<=` `key`, `-1` for `pid0`.
pub fn search_node<B: AsRef<[u8]>>(page: &BTreePage<B>, key: &[u8]) -> isize {
    search(page, key).node_slot()
}

/// Lower bound over `[0, hi)` where every slot at or past `hi` is known to
/// be greater than the key.
fn lower_bound(hi: usize, mut cmp: impl FnMut(usize) -> Ordering) -> SearchResult {
    let (mut lo, mut hi) = (0usize, hi);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(mid) {
            Ordering::Less => lo = mid + 1,
            Ordering::Equal => return SearchResult { found: true, slot: mid },
            Ordering::Greater => hi = mid,
        }
    }
    SearchResult { found: false, slot: lo }
}

/// Bounds-checked reader over a page image that may be torn or garbage.
#[derive(Clone, Copy)]
pub struct RawPage<'a> {
    payload: &'a [u8],
}

impl<'a> RawPage<'a> {
    /// Wraps a page image; `None` if it is too short to hold the headers.
    pub fn new(page: &'a [u8]) -> Option<Self> {
        let payload = page.get(PAGE_HDR_LEN..)?;
        (payload.len() >= PAYLOAD_HEADER_LEN).then_some(Self { payload })
    }

    fn u16(&self, off: usize) -> Option<u16> {
        let raw = self.payload.get(off..off + 2)?;
        Some(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn u32(&self, off: usize) -> Option<u32> {
        let raw: [u8; 4] = self.payload.get(off..off + 4)?.try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    fn u64(&self, off: usize) -> Option<u64> {
        let raw: [u8; 8] = self.payload.get(off..off + 8)?.try_into().ok()?;
        Some(u64::from_be_bytes(raw))
    }

    /// Page level.
    pub fn level(&self) -> Option<u16> {
        self.u16(0).filter(|level| *level >= LEAF_LEVEL)
    }

    /// Record count, bounded by what the slot array can hold.
    pub fn nrecs(&self) -> Option<usize> {
        let items = self.u16(2)? as usize;
        let max = (self.payload.len() - PAYLOAD_HEADER_LEN) / SLOT_LEN;
        (1..=max).contains(&items).then(|| items - 1)
    }

    fn prefix_len(&self) -> Option<usize> {
        self.u16(42).map(usize::from)
    }

    /// Leftmost child.
    pub fn pid0(&self) -> Option<u32> {
        self.u32(12)
    }

    /// Foster child, 0 if none.
    pub fn foster(&self) -> Option<u32> {
        self.u32(16)
    }

    fn slot(&self, item: usize) -> Option<(PoorKey, &'a [u8], bool)> {
        let base = PAYLOAD_HEADER_LEN + item * SLOT_LEN;
        let poor = self.u16(base)?;
        let off = self.u16(base + 2)? as usize;
        let raw_len = self.u16(base + 4)?;
        let len = (raw_len & 0x7FFF) as usize;
        let data = self.payload.get(off..off.checked_add(len)?)?;
        Some((poor, data, raw_len & 0x8000 != 0))
    }

    fn fence(&self) -> Option<(&'a [u8], &'a [u8])> {
        let (_, data, _) = self.slot(0)?;
        let low_len = self.u16(36)? as usize;
        let high_len = self.u16(38)? as usize;
        let prefix = self.prefix_len()?;
        let low = data.get(..low_len)?;
        let stored = high_len.checked_sub(prefix)?;
        let high = data.get(low_len..low_len.checked_add(stored)?)?;
        low.get(..prefix)?;
        Some((low, high))
    }

    /// Key relation to the fence range: `Less` below fence-low, `Greater`
    /// at or above fence-high, `Equal` inside.
    pub fn fence_relation(&self, key: &[u8]) -> Option<Ordering> {
        let (low, high_rest) = self.fence()?;
        if key < low {
            return Some(Ordering::Less);
        }
        let prefix = &low[..self.prefix_len()?];
        Some(match cmp_prefixed(key, prefix, high_rest) {
            Ordering::Less => Ordering::Equal,
            _ => Ordering::Greater,
        })
    }

    fn trunc_key(&self, slot: usize, leaf: bool) -> Option<(PoorKey, &'a [u8])> {
        let (poor, data, _) = self.slot(slot + 1)?;
        let key = if leaf {
            let klen = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
            data.get(LEAF_RECORD_OVERHEAD..LEAF_RECORD_OVERHEAD.checked_add(klen)?)?
        } else {
            data.get(NODE_RECORD_OVERHEAD..)?
        };
        Some((poor, key))
    }

    /// Element bytes of a leaf slot, `None` for ghosts.
    pub fn element(&self, slot: usize) -> Option<Option<&'a [u8]>> {
        let (_, data, ghost) = self.slot(slot + 1)?;
        let klen = u16::from_be_bytes([*data.first()?, *data.get(1)?]) as usize;
        let element = data.get(LEAF_RECORD_OVERHEAD.checked_add(klen)?..)?;
        Some((!ghost).then_some(element))
    }

    /// Child pointer and emlsn of an interior slot, `pid0` for `-1`.
    pub fn child(&self, slot: isize) -> Option<(u32, Lsn)> {
        if slot < 0 {
            return Some((self.pid0()?, Lsn(self.u64(28)?)));
        }
        let (_, data, _) = self.slot(slot as usize + 1)?;
        let child = u32::from_be_bytes(data.get(0..4)?.try_into().ok()?);
        let emlsn = u64::from_be_bytes(data.get(4..12)?.try_into().ok()?);
        Some((child, Lsn(emlsn)))
    }

    /// Robust variant of [`search`].
    pub fn search(&self, key: &[u8]) -> Option<SearchResult> {
        let nrecs = self.nrecs()?;
        let leaf = self.level()? == LEAF_LEVEL;
        let prefix = self.prefix_len()?;
        let suffix = key.get(prefix..)?;
        let poor = extract_poor_man_key(suffix);
        let mut broken = false;
        let result = lower_bound(nrecs, |slot| match self.trunc_key(slot, leaf) {
            Some((slot_poor, trunc)) => probe(slot_poor, poor, || trunc.cmp(suffix)),
            None => {
                broken = true;
                Ordering::Greater
            }
        });
        (!broken).then_some(result)
    }
}
