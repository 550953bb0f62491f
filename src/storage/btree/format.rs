//! Page construction: formatting empty pages and stealing slot ranges
//! from existing pages into a freshly formatted one.

use super::key::extract_poor_man_key;
use super::page::{pack_leaf_record, pack_node_record, BTreePage, LEAF_LEVEL};
use crate::types::{FosterError, Lsn, PageId, Result};

/// Header values and fences for a freshly formatted page.
#[derive(Clone, Debug)]
pub struct FormatParams<'a> {
    /// Page being formatted.
    pub pid: PageId,
    /// LSN stamped on the page.
    pub lsn: Lsn,
    /// Root page number of the owning tree.
    pub root: u32,
    /// 1 for leaves.
    pub level: u16,
    /// Leftmost child (interior pages).
    pub pid0: u32,
    /// Expected minimum LSN of `pid0`.
    pub pid0_emlsn: Lsn,
    /// Foster child, 0 if none.
    pub foster: u32,
    /// Expected minimum LSN of the foster child.
    pub foster_emlsn: Lsn,
    /// Inclusive lower fence.
    pub fence_low: &'a [u8],
    /// Exclusive upper fence.
    pub fence_high: &'a [u8],
    /// Chain-high fence, empty when the page heads no foster chain.
    pub chain_high: &'a [u8],
}

impl<'a> FormatParams<'a> {
    /// An empty leaf with the given fences.
    pub fn leaf(pid: PageId, root: u32, fence_low: &'a [u8], fence_high: &'a [u8]) -> Self {
        Self {
            pid,
            lsn: Lsn::ZERO,
            root,
            level: LEAF_LEVEL,
            pid0: 0,
            pid0_emlsn: Lsn::ZERO,
            foster: 0,
            foster_emlsn: Lsn::ZERO,
            fence_low,
            fence_high,
            chain_high: &[],
        }
    }

    fn check(&self) -> Result<()> {
        if self.fence_low >= self.fence_high {
            return Err(FosterError::Invalid("fence-low must be below fence-high"));
        }
        if self.foster != 0 && self.chain_high.is_empty() {
            return Err(FosterError::Invalid("foster child requires a chain-high fence"));
        }
        if !self.chain_high.is_empty() && self.chain_high < self.fence_high {
            return Err(FosterError::Invalid("chain-high below fence-high"));
        }
        if self.level > LEAF_LEVEL && self.pid0 == 0 {
            return Err(FosterError::Invalid("interior page requires pid0"));
        }
        Ok(())
    }
}

/// A contiguous slot range of a source page.
pub struct StealRange<'a> {
    /// Source page.
    pub page: BTreePage<&'a [u8]>,
    /// First slot, inclusive.
    pub from: usize,
    /// Last slot, exclusive.
    pub to: usize,
}

impl<'a> StealRange<'a> {
    /// Slots `[from, to)` of `page`.
    pub fn new(page: &'a [u8], from: usize, to: usize) -> Self {
        Self {
            page: BTreePage::wrap(page),
            from,
            to,
        }
    }
}

/// Zeroes the page and writes headers plus the fence record.
pub fn format<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut BTreePage<B>,
    params: &FormatParams<'_>,
) -> Result<()> {
    params.check()?;
    page.init(params)
}

/// Formats `dest` and appends the records of up to two source ranges, in
/// order, re-truncating each key to the destination's prefix. With
/// `demote_pid0`, the second source's `pid0` becomes an ordinary slot keyed
/// by its fence-low, as needed when two interior pages are joined.
pub fn format_steal<B: AsRef<[u8]> + AsMut<[u8]>>(
    dest: &mut BTreePage<B>,
    params: &FormatParams<'_>,
    src1: Option<&StealRange<'_>>,
    src2: Option<&StealRange<'_>>,
    demote_pid0: bool,
) -> Result<()> {
    format(dest, params)?;
    if let Some(src) = src1 {
        steal(dest, src)?;
    }
    if let Some(src) = src2 {
        if demote_pid0 && !src.page.is_leaf() {
            let key = src.page.fence_low();
            append_node(dest, key, src.page.pid0(), src.page.pid0_emlsn())?;
        }
        steal(dest, src)?;
    }
    dest.set_skew(0);
    Ok(())
}

fn steal<B: AsRef<[u8]> + AsMut<[u8]>>(dest: &mut BTreePage<B>, src: &StealRange<'_>) -> Result<()> {
    if src.page.is_leaf() != dest.is_leaf() {
        return Err(FosterError::Invalid("cannot steal records across levels"));
    }
    if src.to > src.page.nrecs() || src.from > src.to {
        return Err(FosterError::Invalid("steal range outside source page"));
    }
    for slot in src.from..src.to {
        let key = src.page.key(slot);
        if src.page.is_leaf() {
            let prefix = dest.prefix_len();
            let trunc = key
                .get(prefix..)
                .ok_or(FosterError::Invalid("stolen key shorter than page prefix"))?;
            let data = pack_leaf_record(trunc, src.page.element(slot));
            let at = dest.item_count();
            dest.insert_item(at, src.page.is_ghost(slot), extract_poor_man_key(trunc), &data)?;
        } else {
            append_node(dest, &key, src.page.child(slot), src.page.child_emlsn(slot))?;
        }
    }
    Ok(())
}

fn append_node<B: AsRef<[u8]> + AsMut<[u8]>>(
    dest: &mut BTreePage<B>,
    key: &[u8],
    child: u32,
    emlsn: Lsn,
) -> Result<()> {
    let prefix = dest.prefix_len();
    let trunc = key
        .get(prefix..)
        .ok_or(FosterError::Invalid("stolen key shorter than page prefix"))?;
    let data = pack_node_record(trunc, child, emlsn);
    let at = dest.item_count();
    dest.insert_item(at, false, extract_poor_man_key(trunc), &data)
}
