//! Slotted page layout for foster B-tree pages.
//!
//! After the 32-byte page header the payload holds a fixed B-tree header,
//! then the slot array growing forward, then free space, then the record
//! heap growing backward from the end of the page. Item 0 is always the
//! fence record `low ‖ high[prefix..] ‖ chain_high`; items `1..` are
//! records ("slot `s`" in the record-level API is item `s + 1`).

use std::cmp::Ordering;

use smallvec::SmallVec;

use super::format::FormatParams;
use super::key::{common_leading_bytes, extract_poor_man_key, KeyBuf, PoorKey};
use crate::types::page::{
    page_lsn, read_u16, read_u32, read_u64, set_page_lsn, PageHeader, PageKind, PAGE_HDR_LEN,
};
use crate::types::{FosterError, Lsn, PageId, Result};

/// Number of bytes used by the B-tree payload header.
pub const PAYLOAD_HEADER_LEN: usize = 48;

const LEVEL_OFFSET: usize = 0;
const ITEM_COUNT_OFFSET: usize = 2;
const GHOST_COUNT_OFFSET: usize = 4;
const RECORD_HEAD_OFFSET: usize = 6;
const ROOT_OFFSET: usize = 8;
const PID0_OFFSET: usize = 12;
const FOSTER_OFFSET: usize = 16;
const FOSTER_EMLSN_OFFSET: usize = 20;
const PID0_EMLSN_OFFSET: usize = 28;
const FENCE_LOW_LEN_OFFSET: usize = 36;
const FENCE_HIGH_LEN_OFFSET: usize = 38;
const CHAIN_HIGH_LEN_OFFSET: usize = 40;
const PREFIX_LEN_OFFSET: usize = 42;
const SKEW_OFFSET: usize = 44;
const RESERVED_OFFSET: usize = 46;

/// Size of one slot: poor-man's key, heap offset, length with ghost bit.
pub const SLOT_LEN: usize = 6;
const SLOT_POOR: usize = 0;
const SLOT_OFFSET: usize = 2;
const SLOT_LENGTH: usize = 4;
const GHOST_BIT: u16 = 0x8000;

/// Leaf record header: `key_len:u16`.
pub const LEAF_RECORD_OVERHEAD: usize = 2;
/// Node record header: `child:u32` + `emlsn:u64`.
pub const NODE_RECORD_OVERHEAD: usize = 12;

/// Level of leaf pages.
pub const LEAF_LEVEL: u16 = 1;

/// Length and liveness of one slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlotState {
    /// A live record of the given length.
    Live(u16),
    /// A ghost occupying the given length.
    Ghost(u16),
}

impl SlotState {
    fn from_raw(raw: u16) -> Self {
        if raw & GHOST_BIT != 0 {
            SlotState::Ghost(raw & !GHOST_BIT)
        } else {
            SlotState::Live(raw)
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            SlotState::Live(len) => len,
            SlotState::Ghost(len) => len | GHOST_BIT,
        }
    }

    /// Bytes occupied in the heap.
    pub fn len(self) -> usize {
        match self {
            SlotState::Live(len) | SlotState::Ghost(len) => len as usize,
        }
    }

    /// True for zero-length slots (only possible mid-resize).
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// True for ghosts.
    pub fn is_ghost(self) -> bool {
        matches!(self, SlotState::Ghost(_))
    }
}

/// Largest `keystr + element` a leaf accepts for the given page size. A page
/// must always hold three maximal fence keys plus two maximal records so a
/// split can make progress.
pub fn max_entry_size(page_size: usize) -> usize {
    let data = page_size - PAGE_HDR_LEN - PAYLOAD_HEADER_LEN;
    (data - 3 * SLOT_LEN - 2 * NODE_RECORD_OVERHEAD) / 5 - 1
}

/// Packs the fence record. Returns the bytes and the prefix length shared
/// by `low` and `high`.
pub fn pack_fence_record(low: &[u8], high: &[u8], chain_high: &[u8]) -> (Vec<u8>, usize) {
    let prefix = common_leading_bytes(low, high);
    let mut out = Vec::with_capacity(low.len() + high.len() - prefix + chain_high.len());
    out.extend_from_slice(low);
    out.extend_from_slice(&high[prefix..]);
    out.extend_from_slice(chain_high);
    (out, prefix)
}

/// Packs a leaf record from a truncated key and its element.
pub fn pack_leaf_record(trunc_key: &[u8], element: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEAF_RECORD_OVERHEAD + trunc_key.len() + element.len());
    out.extend_from_slice(&(trunc_key.len() as u16).to_be_bytes());
    out.extend_from_slice(trunc_key);
    out.extend_from_slice(element);
    out
}

/// Packs a node record from a truncated key, child pointer and child emlsn.
pub fn pack_node_record(trunc_key: &[u8], child: u32, emlsn: Lsn) -> Vec<u8> {
    let mut out = Vec::with_capacity(NODE_RECORD_OVERHEAD + trunc_key.len());
    out.extend_from_slice(&child.to_be_bytes());
    out.extend_from_slice(&emlsn.0.to_be_bytes());
    out.extend_from_slice(trunc_key);
    out
}

/// Bytes a leaf record occupies in the heap.
pub fn leaf_record_len(trunc_key_len: usize, element_len: usize) -> usize {
    LEAF_RECORD_OVERHEAD + trunc_key_len + element_len
}

/// Bytes a node record occupies in the heap.
pub fn node_record_len(trunc_key_len: usize) -> usize {
    NODE_RECORD_OVERHEAD + trunc_key_len
}

/// Compares `key` against `prefix ‖ rest` without materialising the latter.
pub fn cmp_prefixed(key: &[u8], prefix: &[u8], rest: &[u8]) -> Ordering {
    let head = key.len().min(prefix.len());
    match key[..head].cmp(&prefix[..head]) {
        Ordering::Equal if key.len() < prefix.len() => Ordering::Less,
        Ordering::Equal => key[prefix.len()..].cmp(rest),
        other => other,
    }
}

/// Typed view over a B-tree page buffer.
pub struct BTreePage<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> BTreePage<B> {
    /// Wraps a page after validating its layout.
    pub fn open(buf: B) -> Result<Self> {
        let page = Self { buf };
        page.validate_layout()?;
        Ok(page)
    }

    /// Wraps a buffer whose layout is trusted (freshly formatted or latched
    /// and previously validated).
    pub(crate) fn wrap(buf: B) -> Self {
        Self { buf }
    }

    /// Underlying buffer.
    pub fn into_inner(self) -> B {
        self.buf
    }

    /// Whole page bytes.
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn p(&self) -> &[u8] {
        &self.buf.as_ref()[PAGE_HDR_LEN..]
    }

    fn u16_at(&self, off: usize) -> u16 {
        read_u16(self.p(), off)
    }

    /// Page size.
    pub fn page_size(&self) -> usize {
        self.buf.as_ref().len()
    }

    fn payload_len(&self) -> usize {
        self.page_size() - PAGE_HDR_LEN
    }

    /// Page identity from the page header.
    pub fn pid(&self) -> PageId {
        let raw = self.buf.as_ref();
        PageId::new(read_u32(raw, 12), read_u32(raw, 16))
    }

    /// Page LSN.
    pub fn lsn(&self) -> Lsn {
        page_lsn(self.buf.as_ref())
    }

    /// 1 for leaves, greater for interior pages.
    pub fn level(&self) -> u16 {
        self.u16_at(LEVEL_OFFSET)
    }

    /// True for leaves.
    pub fn is_leaf(&self) -> bool {
        self.level() == LEAF_LEVEL
    }

    /// Items including the fence record.
    pub fn item_count(&self) -> usize {
        self.u16_at(ITEM_COUNT_OFFSET) as usize
    }

    /// Records (items minus the fence record).
    pub fn nrecs(&self) -> usize {
        self.item_count().saturating_sub(1)
    }

    /// Ghost records.
    pub fn ghost_count(&self) -> usize {
        self.u16_at(GHOST_COUNT_OFFSET) as usize
    }

    fn record_head(&self) -> usize {
        self.u16_at(RECORD_HEAD_OFFSET) as usize
    }

    /// Root page number of the tree this page belongs to.
    pub fn root(&self) -> u32 {
        read_u32(self.p(), ROOT_OFFSET)
    }

    /// Leftmost child (interior pages).
    pub fn pid0(&self) -> u32 {
        read_u32(self.p(), PID0_OFFSET)
    }

    /// Expected minimum LSN of `pid0`.
    pub fn pid0_emlsn(&self) -> Lsn {
        Lsn(read_u64(self.p(), PID0_EMLSN_OFFSET))
    }

    /// Foster child page number, 0 if none.
    pub fn foster(&self) -> u32 {
        read_u32(self.p(), FOSTER_OFFSET)
    }

    /// Foster child and its expected minimum LSN.
    pub fn foster_child(&self) -> Option<(u32, Lsn)> {
        let foster = self.foster();
        (foster != 0).then(|| (foster, Lsn(read_u64(self.p(), FOSTER_EMLSN_OFFSET))))
    }

    /// Bytes shared by every key on the page.
    pub fn prefix_len(&self) -> usize {
        self.u16_at(PREFIX_LEN_OFFSET) as usize
    }

    /// Consecutive insert-position skew.
    pub fn skew(&self) -> i16 {
        self.u16_at(SKEW_OFFSET) as i16
    }

    fn fence_low_len(&self) -> usize {
        self.u16_at(FENCE_LOW_LEN_OFFSET) as usize
    }

    fn fence_high_len(&self) -> usize {
        self.u16_at(FENCE_HIGH_LEN_OFFSET) as usize
    }

    fn chain_high_len(&self) -> usize {
        self.u16_at(CHAIN_HIGH_LEN_OFFSET) as usize
    }

    fn slot_base(&self, item: usize) -> usize {
        PAYLOAD_HEADER_LEN + item * SLOT_LEN
    }

    /// State of an item's slot.
    pub fn item_state(&self, item: usize) -> SlotState {
        SlotState::from_raw(self.u16_at(self.slot_base(item) + SLOT_LENGTH))
    }

    fn item_offset(&self, item: usize) -> usize {
        self.u16_at(self.slot_base(item) + SLOT_OFFSET) as usize
    }

    fn item_poor(&self, item: usize) -> PoorKey {
        self.u16_at(self.slot_base(item) + SLOT_POOR)
    }

    /// Heap bytes of an item.
    pub fn item_data(&self, item: usize) -> &[u8] {
        let off = self.item_offset(item);
        &self.p()[off..off + self.item_state(item).len()]
    }

    /// Fence-low key (inclusive).
    pub fn fence_low(&self) -> &[u8] {
        &self.item_data(0)[..self.fence_low_len()]
    }

    /// Fence-high key with the prefix removed.
    pub fn fence_high_noprefix(&self) -> &[u8] {
        let low = self.fence_low_len();
        let stored = self.fence_high_len() - self.prefix_len();
        &self.item_data(0)[low..low + stored]
    }

    /// Fence-high key (exclusive): the foster key.
    pub fn fence_high(&self) -> KeyBuf {
        let mut out = KeyBuf::from_slice(&self.fence_low()[..self.prefix_len()]);
        out.extend_from_slice(self.fence_high_noprefix());
        out
    }

    /// Exclusive upper bound of the whole foster chain, if this page is part
    /// of one that continues past it.
    pub fn chain_high(&self) -> Option<&[u8]> {
        let len = self.chain_high_len();
        if len == 0 {
            return None;
        }
        let data = self.item_data(0);
        Some(&data[data.len() - len..])
    }

    /// Page prefix bytes.
    pub fn prefix(&self) -> &[u8] {
        &self.fence_low()[..self.prefix_len()]
    }

    /// Orders `key` against fence-high.
    pub fn compare_with_fence_high(&self, key: &[u8]) -> Ordering {
        cmp_prefixed(key, self.prefix(), self.fence_high_noprefix())
    }

    /// True when `fence_low <= key < fence_high`.
    pub fn fence_contains(&self, key: &[u8]) -> bool {
        key >= self.fence_low() && self.compare_with_fence_high(key) == Ordering::Less
    }

    /// True when the key is beyond this page but inside its foster chain.
    pub fn belongs_to_foster(&self, key: &[u8]) -> bool {
        self.foster() != 0 && self.compare_with_fence_high(key) != Ordering::Less
    }

    /// True when the slot is a ghost.
    pub fn is_ghost(&self, slot: usize) -> bool {
        self.item_state(slot + 1).is_ghost()
    }

    /// Poor-man's key of a slot.
    pub fn poor(&self, slot: usize) -> PoorKey {
        self.item_poor(slot + 1)
    }

    /// Key bytes stored in a slot, prefix removed.
    pub fn trunc_key(&self, slot: usize) -> &[u8] {
        let data = self.item_data(slot + 1);
        if self.is_leaf() {
            let klen = read_u16(data, 0) as usize;
            &data[LEAF_RECORD_OVERHEAD..LEAF_RECORD_OVERHEAD + klen]
        } else {
            &data[NODE_RECORD_OVERHEAD..]
        }
    }

    /// Full key of a slot.
    pub fn key(&self, slot: usize) -> KeyBuf {
        let mut out = KeyBuf::from_slice(self.prefix());
        out.extend_from_slice(self.trunc_key(slot));
        out
    }

    /// Element of a leaf slot.
    pub fn element(&self, slot: usize) -> &[u8] {
        let data = self.item_data(slot + 1);
        let klen = read_u16(data, 0) as usize;
        &data[LEAF_RECORD_OVERHEAD + klen..]
    }

    /// Child pointer of an interior slot.
    pub fn child(&self, slot: usize) -> u32 {
        read_u32(self.item_data(slot + 1), 0)
    }

    /// Expected minimum LSN of an interior slot's child.
    pub fn child_emlsn(&self, slot: usize) -> Lsn {
        Lsn(read_u64(self.item_data(slot + 1), 4))
    }

    /// Child for a `search_node` result: `-1` is `pid0`.
    pub fn child_at(&self, slot: isize) -> u32 {
        if slot < 0 {
            self.pid0()
        } else {
            self.child(slot as usize)
        }
    }

    /// Contiguous free bytes between the slot array and the heap.
    pub fn usable_space(&self) -> usize {
        self.record_head()
            .saturating_sub(self.slot_base(self.item_count()))
    }

    /// Free bytes after a compaction.
    pub fn free_space(&self) -> usize {
        let used: usize = (0..self.item_count())
            .map(|i| self.item_state(i).len())
            .sum();
        self.payload_len()
            .saturating_sub(self.slot_base(self.item_count()) + used)
    }

    /// Bytes held by slots and item data.
    pub fn used_space(&self) -> usize {
        self.payload_len() - PAYLOAD_HEADER_LEN - self.free_space()
    }

    /// Heap bytes held by ghost records, slot included.
    pub fn ghost_space(&self) -> usize {
        (1..self.item_count())
            .map(|i| self.item_state(i))
            .filter(|s| s.is_ghost())
            .map(|s| s.len() + SLOT_LEN)
            .sum()
    }

    /// Whether an item of `data_len` bytes fits, possibly after compaction.
    pub fn check_space_for_insert(&self, data_len: usize) -> bool {
        self.free_space() >= data_len + SLOT_LEN
    }

    fn validate_layout(&self) -> Result<()> {
        let header = PageHeader::decode(self.buf.as_ref())?;
        if header.kind != PageKind::BTree {
            return Err(FosterError::Corruption("page is not a b-tree page"));
        }
        if header.page_size as usize != self.page_size() {
            return Err(FosterError::Corruption("page size does not match buffer"));
        }
        let payload = self.payload_len();
        if self.level() == 0 {
            return Err(FosterError::Corruption("b-tree level is zero"));
        }
        let items = self.item_count();
        if items == 0 {
            return Err(FosterError::Corruption("b-tree page has no fence record"));
        }
        if self.slot_base(items) > self.record_head() || self.record_head() > payload {
            return Err(FosterError::Corruption("slot array overlaps record heap"));
        }
        let mut ghosts = 0;
        for item in 0..items {
            let state = self.item_state(item);
            let off = self.item_offset(item);
            if off < self.record_head() || off + state.len() > payload {
                return Err(FosterError::Corruption("slot points outside record heap"));
            }
            if state.is_ghost() {
                if item == 0 {
                    return Err(FosterError::Corruption("fence record marked ghost"));
                }
                ghosts += 1;
            }
            if item > 0 {
                let min = if self.level() == LEAF_LEVEL {
                    LEAF_RECORD_OVERHEAD
                } else {
                    NODE_RECORD_OVERHEAD
                };
                if state.len() < min {
                    return Err(FosterError::Corruption("record shorter than its header"));
                }
                if self.level() == LEAF_LEVEL {
                    let klen = read_u16(self.item_data(item), 0) as usize;
                    if LEAF_RECORD_OVERHEAD + klen > state.len() {
                        return Err(FosterError::Corruption("leaf key overruns record"));
                    }
                }
            }
        }
        if ghosts != self.ghost_count() {
            return Err(FosterError::Corruption("ghost count does not match slots"));
        }
        let prefix = self.prefix_len();
        if prefix > self.fence_low_len() || prefix > self.fence_high_len() {
            return Err(FosterError::Corruption("prefix longer than fence keys"));
        }
        let fence_len = self.fence_low_len() + self.fence_high_len() - prefix + self.chain_high_len();
        if fence_len != self.item_state(0).len() {
            return Err(FosterError::Corruption("fence lengths do not match fence record"));
        }
        if self.foster() != 0 && self.chain_high_len() == 0 {
            return Err(FosterError::Corruption("foster child without chain-high fence"));
        }
        Ok(())
    }

    /// Full self-check: layout, fences, key order and poor-man's keys.
    pub fn check_invariants(&self) -> Result<()> {
        self.validate_layout()?;
        let low = self.fence_low();
        let high = self.fence_high();
        if low >= high.as_slice() {
            return Err(FosterError::Corruption("fence-low not below fence-high"));
        }
        if let Some(chain) = self.chain_high() {
            if high.as_slice() > chain {
                return Err(FosterError::Corruption("fence-high above chain-high"));
            }
        }
        if common_leading_bytes(low, &high) < self.prefix_len() {
            return Err(FosterError::Corruption("prefix not shared by fences"));
        }
        if !self.is_leaf() && self.pid0() == 0 {
            return Err(FosterError::Corruption("interior page without pid0"));
        }
        let mut prev: Option<KeyBuf> = None;
        for slot in 0..self.nrecs() {
            let trunc = self.trunc_key(slot);
            if self.poor(slot) != extract_poor_man_key(trunc) {
                return Err(FosterError::Corruption("poor-man's key mismatch"));
            }
            let key = self.key(slot);
            if let Some(prev) = &prev {
                if prev.as_slice() >= key.as_slice() {
                    return Err(FosterError::Corruption("keys out of order"));
                }
            } else if key.as_slice() < low {
                return Err(FosterError::Corruption("key below fence-low"));
            }
            if !self.is_leaf() && self.child(slot) == 0 {
                return Err(FosterError::Corruption("interior record without child"));
            }
            prev = Some(key);
        }
        if let Some(last) = prev {
            if last.as_slice() >= high.as_slice() {
                return Err(FosterError::Corruption("key at or above fence-high"));
            }
        }
        Ok(())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> BTreePage<B> {
    fn pm(&mut self) -> &mut [u8] {
        &mut self.buf.as_mut()[PAGE_HDR_LEN..]
    }

    fn put_u16(&mut self, off: usize, v: u16) {
        self.pm()[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        self.pm()[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, off: usize, v: u64) {
        self.pm()[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }

    /// Zeroes the page and writes headers plus the fence record.
    pub(crate) fn init(&mut self, params: &FormatParams<'_>) -> Result<()> {
        let page_size = self.page_size();
        let raw = self.buf.as_mut();
        raw.fill(0);
        PageHeader::new(params.pid, PageKind::BTree, page_size as u32)?
            .with_lsn(params.lsn)
            .encode(raw)?;
        let (fence, prefix) =
            pack_fence_record(params.fence_low, params.fence_high, params.chain_high);
        let payload_len = self.payload_len();
        self.put_u16(LEVEL_OFFSET, params.level);
        self.put_u16(RECORD_HEAD_OFFSET, payload_len as u16);
        self.put_u32(ROOT_OFFSET, params.root);
        self.put_u32(PID0_OFFSET, params.pid0);
        self.put_u64(PID0_EMLSN_OFFSET, params.pid0_emlsn.0);
        self.put_u32(FOSTER_OFFSET, params.foster);
        self.put_u64(FOSTER_EMLSN_OFFSET, params.foster_emlsn.0);
        self.put_u16(FENCE_LOW_LEN_OFFSET, params.fence_low.len() as u16);
        self.put_u16(FENCE_HIGH_LEN_OFFSET, params.fence_high.len() as u16);
        self.put_u16(CHAIN_HIGH_LEN_OFFSET, params.chain_high.len() as u16);
        self.put_u16(PREFIX_LEN_OFFSET, prefix as u16);
        self.put_u16(RESERVED_OFFSET, 0);
        self.insert_item(0, false, 0, &fence)
    }

    /// Stamps the page LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        set_page_lsn(self.buf.as_mut(), lsn);
    }

    /// Sets the skew counter.
    pub(crate) fn set_skew(&mut self, skew: i16) {
        self.put_u16(SKEW_OFFSET, skew as u16);
    }

    /// Sets or clears the foster link. Callers keep the chain-high fence
    /// in step through [`BTreePage::replace_fences`].
    pub(crate) fn set_foster(&mut self, foster: u32, emlsn: Lsn) {
        self.put_u32(FOSTER_OFFSET, foster);
        self.put_u64(FOSTER_EMLSN_OFFSET, emlsn.0);
    }

    fn set_item_count(&mut self, n: usize) {
        self.put_u16(ITEM_COUNT_OFFSET, n as u16);
    }

    fn set_ghost_count(&mut self, n: usize) {
        self.put_u16(GHOST_COUNT_OFFSET, n as u16);
    }

    fn set_record_head(&mut self, off: usize) {
        self.put_u16(RECORD_HEAD_OFFSET, off as u16);
    }

    fn write_slot(&mut self, item: usize, poor: PoorKey, offset: usize, state: SlotState) {
        let base = self.slot_base(item);
        self.put_u16(base + SLOT_POOR, poor);
        self.put_u16(base + SLOT_OFFSET, offset as u16);
        self.put_u16(base + SLOT_LENGTH, state.to_raw());
    }

    fn set_item_state(&mut self, item: usize, state: SlotState) {
        let base = self.slot_base(item);
        self.put_u16(base + SLOT_LENGTH, state.to_raw());
    }

    /// Mutable heap bytes of an item.
    pub(crate) fn item_data_mut(&mut self, item: usize) -> &mut [u8] {
        let off = self.item_offset(item);
        let len = self.item_state(item).len();
        &mut self.pm()[off..off + len]
    }

    /// Carves `len` heap bytes, compacting if the contiguous gap is short.
    fn alloc(&mut self, len: usize, extra_slot: bool) -> Result<usize> {
        let slot_cost = if extra_slot { SLOT_LEN } else { 0 };
        if self.usable_space() < len + slot_cost {
            if self.free_space() < len + slot_cost {
                return Err(FosterError::RecordWontFit {
                    len,
                    max: self.free_space().saturating_sub(slot_cost),
                });
            }
            self.compact();
        }
        let head = self.record_head() - len;
        self.set_record_head(head);
        Ok(head)
    }

    /// Inserts a new item at `item`, shifting later slots right.
    pub(crate) fn insert_item(
        &mut self,
        item: usize,
        ghost: bool,
        poor: PoorKey,
        data: &[u8],
    ) -> Result<()> {
        let count = self.item_count();
        if item > count {
            return Err(FosterError::Invalid("item index past end"));
        }
        let off = self.alloc(data.len(), true)?;
        self.pm()[off..off + data.len()].copy_from_slice(data);
        let from = self.slot_base(item);
        let to = self.slot_base(count);
        self.pm().copy_within(from..to, from + SLOT_LEN);
        let len = data.len() as u16;
        let state = if ghost {
            SlotState::Ghost(len)
        } else {
            SlotState::Live(len)
        };
        self.write_slot(item, poor, off, state);
        self.set_item_count(count + 1);
        if ghost {
            let ghosts = self.ghost_count();
            self.set_ghost_count(ghosts + 1);
        }
        Ok(())
    }

    /// Removes an item, shifting later slots left. Heap bytes are reclaimed
    /// by the next compaction.
    pub(crate) fn delete_item(&mut self, item: usize) {
        let count = self.item_count();
        if self.item_state(item).is_ghost() {
            let ghosts = self.ghost_count();
            self.set_ghost_count(ghosts - 1);
        }
        let from = self.slot_base(item + 1);
        let to = self.slot_base(count);
        let dst = self.slot_base(item);
        self.pm().copy_within(from..to, dst);
        self.set_item_count(count - 1);
    }

    /// Resizes an item, keeping its first `keep` bytes.
    pub(crate) fn resize_item(&mut self, item: usize, new_len: usize, keep: usize) -> Result<()> {
        let state = self.item_state(item);
        let resized = |len: usize| match state {
            SlotState::Live(_) => SlotState::Live(len as u16),
            SlotState::Ghost(_) => SlotState::Ghost(len as u16),
        };
        if new_len <= state.len() {
            self.set_item_state(item, resized(new_len));
            return Ok(());
        }
        let kept: SmallVec<[u8; 128]> =
            SmallVec::from_slice(&self.item_data(item)[..keep.min(state.len())]);
        self.set_item_state(item, resized(0));
        let off = match self.alloc(new_len, false) {
            Ok(off) => off,
            Err(err) => {
                self.set_item_state(item, state);
                return Err(err);
            }
        };
        self.pm()[off..off + kept.len()].copy_from_slice(&kept);
        let poor = self.item_poor(item);
        self.write_slot(item, poor, off, resized(new_len));
        Ok(())
    }

    /// Flips the ghost bit.
    pub(crate) fn set_ghost(&mut self, item: usize, ghost: bool) {
        let state = self.item_state(item);
        if state.is_ghost() == ghost {
            return;
        }
        let len = state.len() as u16;
        let ghosts = self.ghost_count();
        if ghost {
            self.set_item_state(item, SlotState::Ghost(len));
            self.set_ghost_count(ghosts + 1);
        } else {
            self.set_item_state(item, SlotState::Live(len));
            self.set_ghost_count(ghosts - 1);
        }
    }

    /// Rewrites the heap so all free space is contiguous. Item order and
    /// content are unchanged.
    pub fn compact(&mut self) {
        let count = self.item_count();
        let snapshot: Vec<(usize, Vec<u8>)> = (0..count)
            .map(|i| (i, self.item_data(i).to_vec()))
            .collect();
        let mut head = self.payload_len();
        for (item, data) in snapshot {
            head -= data.len();
            self.pm()[head..head + data.len()].copy_from_slice(&data);
            let base = self.slot_base(item);
            self.put_u16(base + SLOT_OFFSET, head as u16);
        }
        self.set_record_head(head);
    }

    /// Replaces the fence record in place, keeping the current prefix length.
    /// The new fences must still share that prefix.
    pub(crate) fn replace_fences(&mut self, low: &[u8], high: &[u8], chain: &[u8]) -> Result<()> {
        let prefix = self.prefix_len();
        if common_leading_bytes(low, high) < prefix {
            return Err(FosterError::Invalid("new fences do not share the page prefix"));
        }
        let mut fence = Vec::with_capacity(low.len() + high.len() + chain.len());
        fence.extend_from_slice(low);
        fence.extend_from_slice(&high[prefix..]);
        fence.extend_from_slice(chain);
        self.resize_item(0, fence.len(), 0)?;
        self.item_data_mut(0).copy_from_slice(&fence);
        self.put_u16(FENCE_LOW_LEN_OFFSET, low.len() as u16);
        self.put_u16(FENCE_HIGH_LEN_OFFSET, high.len() as u16);
        self.put_u16(CHAIN_HIGH_LEN_OFFSET, chain.len() as u16);
        Ok(())
    }

    /// Adjusts the skew counter for an insert landing at `slot` of a page
    /// that held `nrecs` records before the insert.
    pub(crate) fn update_skew(&mut self, slot: usize, nrecs: usize, clamp: i16) {
        if nrecs == 0 {
            return;
        }
        let skew = self.skew();
        let next = if slot == 0 {
            if skew > 0 {
                -1
            } else {
                skew.saturating_sub(1).max(-clamp)
            }
        } else if slot == nrecs {
            if skew < 0 {
                1
            } else {
                skew.saturating_add(1).min(clamp)
            }
        } else {
            0
        };
        self.set_skew(next);
    }

    /// Inserts a leaf record at `slot`. `key` is the full keystr.
    pub(crate) fn insert_leaf_record(
        &mut self,
        slot: usize,
        key: &[u8],
        element: &[u8],
        ghost: bool,
        skew_clamp: i16,
    ) -> Result<()> {
        let trunc = &key[self.prefix_len()..];
        let data = pack_leaf_record(trunc, element);
        let poor = extract_poor_man_key(trunc);
        let nrecs = self.nrecs();
        self.insert_item(slot + 1, ghost, poor, &data)?;
        self.update_skew(slot, nrecs, skew_clamp);
        Ok(())
    }

    /// Inserts a node record at `slot`. `key` is the full keystr.
    pub(crate) fn insert_node_record(
        &mut self,
        slot: usize,
        key: &[u8],
        child: u32,
        emlsn: Lsn,
        skew_clamp: i16,
    ) -> Result<()> {
        let trunc = &key[self.prefix_len()..];
        let data = pack_node_record(trunc, child, emlsn);
        let poor = extract_poor_man_key(trunc);
        let nrecs = self.nrecs();
        self.insert_item(slot + 1, false, poor, &data)?;
        self.update_skew(slot, nrecs, skew_clamp);
        Ok(())
    }

    /// Replaces a leaf slot's element, resizing the record if needed.
    pub(crate) fn replace_element(&mut self, slot: usize, element: &[u8]) -> Result<()> {
        let item = slot + 1;
        let key_part = LEAF_RECORD_OVERHEAD + self.trunc_key(slot).len();
        self.resize_item(item, key_part + element.len(), key_part)?;
        self.item_data_mut(item)[key_part..].copy_from_slice(element);
        Ok(())
    }

    /// Overwrites `bytes` at `offset` inside a leaf slot's element.
    pub(crate) fn overwrite_element(&mut self, slot: usize, offset: usize, bytes: &[u8]) -> Result<()> {
        let item = slot + 1;
        let start = LEAF_RECORD_OVERHEAD + self.trunc_key(slot).len() + offset;
        let data = self.item_data_mut(item);
        let dst = data
            .get_mut(start..start + bytes.len())
            .ok_or(FosterError::Invalid("overwrite past end of element"))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }
}
