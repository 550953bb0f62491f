//! Structural modifications at page level: choosing a split point, building
//! a foster child, shrinking the source, adoption and root growth.

use super::format::{format, format_steal, FormatParams, StealRange};
use super::key::{common_leading_bytes, KeyBuf, KeyStr};
use super::page::BTreePage;
use super::search::search_node;
use crate::config::SplitTuning;
use crate::types::page::PageHeader;
use crate::types::{FosterError, Lsn, PageId, Result};

/// Where a page is carved in two.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SplitPoint {
    /// New fence-high of the source and fence-low of the foster child.
    pub mid: KeyBuf,
    /// First slot that moves to the foster child. Equal to `nrecs` for a
    /// no-record split.
    pub right_begins_from: usize,
}

fn is_skewed_right<B: AsRef<[u8]>>(page: &BTreePage<B>, tuning: &SplitTuning) -> bool {
    page.skew() > tuning.skew_threshold
}

fn is_skewed_left<B: AsRef<[u8]>>(page: &BTreePage<B>, tuning: &SplitTuning) -> bool {
    page.skew() < -tuning.skew_threshold
}

/// Pre-sorted insertion such as a bulk load.
pub fn is_extremely_skewed_right<B: AsRef<[u8]>>(page: &BTreePage<B>, tuning: &SplitTuning) -> bool {
    let ins = i64::from(page.skew());
    let n = page.nrecs() as i64;
    ins > i64::from(tuning.extreme_skew)
        || ins > n * i64::from(tuning.extreme_skew_num) / i64::from(tuning.extreme_skew_den)
        || (ins > 1 && ins >= n - 1)
}

/// Whether a 100/0 split that makes `key` the new fence is worthwhile:
/// inserts are extremely right-skewed, `key` is beyond every record, the
/// page is nearly full and there is still room for the enlarged fences.
pub fn check_chance_for_norecord_split<B: AsRef<[u8]>>(
    page: &BTreePage<B>,
    key: &[u8],
    tuning: &SplitTuning,
    record_cap: Option<u16>,
) -> bool {
    let nrecs = page.nrecs();
    if !page.is_leaf() || nrecs == 0 || !is_extremely_skewed_right(page, tuning) {
        return false;
    }
    let too_early = match record_cap {
        Some(cap) => nrecs + 1 < usize::from(cap),
        None => {
            let usable = page.usable_space();
            let used = page.used_space();
            usable > used * tuning.norecord_used_multiplier as usize / nrecs
                && usable > page.page_size() / tuning.norecord_min_free_divisor as usize
        }
    };
    if too_early {
        return false;
    }
    if page.key(nrecs - 1).as_slice() >= key {
        return false;
    }
    let chain_or_high = page
        .chain_high()
        .map_or_else(|| page.fence_high().len(), <[u8]>::len);
    page.free_space() >= page.fence_low().len() + key.len() + chain_or_high
}

/// Picks the split point for a page that cannot take `key`.
pub fn suggest_fence_for_split<B: AsRef<[u8]>>(
    page: &BTreePage<B>,
    key: &[u8],
    tuning: &SplitTuning,
    record_cap: Option<u16>,
) -> Result<SplitPoint> {
    let nrecs = page.nrecs();
    if check_chance_for_norecord_split(page, key, tuning, record_cap) {
        let last = page.key(nrecs - 1);
        let common = common_leading_bytes(&last, key);
        return Ok(SplitPoint {
            mid: KeyBuf::from_slice(&key[..common + 1]),
            right_begins_from: nrecs,
        });
    }
    if nrecs == 0 {
        return Err(FosterError::Invalid("cannot split an empty page"));
    }
    if nrecs == 1 {
        return Ok(split_single(page, key));
    }

    let window = nrecs / tuning.fence_window_divisor.max(1) as usize;
    let bias = usize::from(tuning.skew_bias_percent);
    let center = if is_skewed_right(page, tuning) {
        nrecs * bias / 100
    } else if is_skewed_left(page, tuning) {
        nrecs * (100 - bias) / 100
    } else {
        nrecs / 2
    }
    .clamp(1, nrecs - 1);
    let start = center.saturating_sub(window).max(1);
    let end = (center + window + 1).min(nrecs);

    let mut best: Option<(usize, usize)> = None;
    for boundary in start..end {
        let len = if page.is_leaf() {
            let k1 = page.trunc_key(boundary - 1);
            let k2 = page.trunc_key(boundary);
            common_leading_bytes(k1, k2) + 1
        } else {
            page.trunc_key(boundary).len()
        };
        let better = match best {
            None => true,
            Some((_, best_len)) => len < best_len || (len == best_len && boundary == center),
        };
        if better {
            best = Some((boundary, len));
        }
    }
    let (boundary, len) = best.ok_or(FosterError::Invalid("no split boundary in window"))?;
    let mut mid = KeyBuf::from_slice(page.prefix());
    mid.extend_from_slice(&page.trunc_key(boundary)[..len]);
    Ok(SplitPoint {
        mid,
        right_begins_from: boundary,
    })
}

/// One record: the separator falls between it and the incoming key.
fn split_single<B: AsRef<[u8]>>(page: &BTreePage<B>, key: &[u8]) -> SplitPoint {
    let only = page.key(0);
    if !page.is_leaf() {
        return SplitPoint {
            mid: only,
            right_begins_from: 0,
        };
    }
    if only.as_slice() < key {
        let common = common_leading_bytes(&only, key);
        SplitPoint {
            mid: KeyBuf::from_slice(&key[..(common + 1).min(key.len())]),
            right_begins_from: 1,
        }
    } else {
        let common = common_leading_bytes(key, &only);
        SplitPoint {
            mid: KeyBuf::from_slice(&only[..(common + 1).min(only.len())]),
            right_begins_from: 0,
        }
    }
}

/// Chain-high the source carries after splitting: unchanged if it already
/// heads a chain, otherwise its old fence-high.
pub fn chain_high_after_split<B: AsRef<[u8]>>(page: &BTreePage<B>) -> KeyBuf {
    match page.chain_high() {
        Some(chain) => KeyBuf::from_slice(chain),
        None => page.fence_high(),
    }
}

/// Builds the image of a new foster child holding slots
/// `[right_begins_from, nrecs)` of `src` and inheriting its foster link.
/// Interior pages move the separator record's child into `pid0`.
pub fn build_foster_child(
    src: &[u8],
    new_pid: PageId,
    right_begins_from: usize,
    mid: &[u8],
) -> Result<Vec<u8>> {
    let page = BTreePage::wrap(src);
    let nrecs = page.nrecs();
    if right_begins_from > nrecs {
        return Err(FosterError::Invalid("split point past last record"));
    }
    let high = page.fence_high();
    let (foster, foster_emlsn) = page.foster_child().unwrap_or((0, Lsn::ZERO));
    let chain: &[u8] = if foster != 0 {
        page.chain_high().unwrap_or_default()
    } else {
        &[]
    };
    let (pid0, pid0_emlsn, from) = if page.is_leaf() {
        (0, Lsn::ZERO, right_begins_from)
    } else {
        if right_begins_from == nrecs {
            return Err(FosterError::Invalid("interior split needs a separator record"));
        }
        (
            page.child(right_begins_from),
            page.child_emlsn(right_begins_from),
            right_begins_from + 1,
        )
    };
    let params = FormatParams {
        pid: new_pid,
        lsn: Lsn::ZERO,
        root: page.root(),
        level: page.level(),
        pid0,
        pid0_emlsn,
        foster,
        foster_emlsn,
        fence_low: mid,
        fence_high: &high,
        chain_high: chain,
    };
    let mut dest = BTreePage::wrap(vec![0u8; src.len()]);
    let range = StealRange::new(src, from, nrecs);
    format_steal(&mut dest, &params, Some(&range), None, false)?;
    Ok(dest.into_inner())
}

/// Rebuilds the source after a split: it keeps `[0, right_begins_from)`,
/// its fence-high becomes `mid` and its foster child is `new_page`.
pub fn shrink_source<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut BTreePage<B>,
    new_page: u32,
    right_begins_from: usize,
    mid: &[u8],
    chain_high: &[u8],
    lsn: Lsn,
) -> Result<()> {
    let scratch = page.bytes().to_vec();
    let src = BTreePage::wrap(scratch.as_slice());
    if right_begins_from > src.nrecs() {
        return Err(FosterError::Invalid("split point past last record"));
    }
    let low = src.fence_low();
    let params = FormatParams {
        pid: src.pid(),
        lsn,
        root: src.root(),
        level: src.level(),
        pid0: src.pid0(),
        pid0_emlsn: src.pid0_emlsn(),
        foster: new_page,
        foster_emlsn: lsn,
        fence_low: low,
        fence_high: mid,
        chain_high,
    };
    let range = StealRange::new(&scratch, 0, right_begins_from);
    format_steal(page, &params, Some(&range), None, false)
}

/// Parent half of adoption: adds `(key, child, emlsn)` after the slot
/// that currently routes `key`.
pub fn adopt_into_parent<B: AsRef<[u8]> + AsMut<[u8]>>(
    parent: &mut BTreePage<B>,
    key: &[u8],
    child: u32,
    emlsn: Lsn,
    skew_clamp: i16,
) -> Result<()> {
    let slot = (search_node(parent, key) + 1) as usize;
    if slot > 0 && parent.key(slot - 1).as_slice() == key {
        return Err(FosterError::Corruption("separator already present in parent"));
    }
    parent.insert_node_record(slot, key, child, emlsn, skew_clamp)
}

/// Child half of adoption: drops the foster link and chain-high fence.
pub fn clear_foster<B: AsRef<[u8]> + AsMut<[u8]>>(child: &mut BTreePage<B>) -> Result<()> {
    let low = KeyBuf::from_slice(child.fence_low());
    let high = child.fence_high();
    child.set_foster(0, Lsn::ZERO);
    child.replace_fences(&low, &high, &[])
}

/// Image of the root relabelled as `new_child`, used when growing the tree.
pub fn root_copy_image(root: &[u8], new_child: PageId) -> Result<Vec<u8>> {
    let mut image = root.to_vec();
    let header = PageHeader::decode(&image)?;
    PageHeader { pid: new_child, ..header }.encode(&mut image)?;
    Ok(image)
}

/// Turns the root into an empty interior page over `new_child`.
pub fn grow_root<B: AsRef<[u8]> + AsMut<[u8]>>(
    root: &mut BTreePage<B>,
    new_child: u32,
    lsn: Lsn,
) -> Result<()> {
    let pid = root.pid();
    let level = root.level() + 1;
    let low = KeyStr::neg_infinity();
    let high = KeyStr::pos_infinity();
    let params = FormatParams {
        level,
        lsn,
        pid0: new_child,
        pid0_emlsn: lsn,
        ..FormatParams::leaf(pid, pid.page, low.as_bytes(), high.as_bytes())
    };
    format(root, &params)
}
