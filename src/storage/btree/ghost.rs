//! Ghost record lifecycle on a single leaf: reserve, mark, unmark,
//! replace and reclaim.
//!
//! These are the physical halves of the ghost log records. Callers hold an
//! exclusive latch and have already logged the change.

use smallvec::SmallVec;

use super::key::KeyBuf;
use super::page::{leaf_record_len, BTreePage, SLOT_LEN};
use crate::types::{FosterError, Result};

/// Inserts a ghost at `slot` whose element is `element_len` zero bytes.
pub fn reserve_ghost<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut BTreePage<B>,
    slot: usize,
    key: &[u8],
    element_len: usize,
    skew_clamp: i16,
) -> Result<()> {
    let zeros: SmallVec<[u8; 64]> = SmallVec::from_elem(0, element_len);
    page.insert_leaf_record(slot, key, &zeros, true, skew_clamp)
}

/// Turns a live record into a ghost without moving bytes.
pub fn mark_ghost<B: AsRef<[u8]> + AsMut<[u8]>>(page: &mut BTreePage<B>, slot: usize) {
    page.set_ghost(slot + 1, true);
}

/// Turns a ghost back into a live record.
pub fn unmark_ghost<B: AsRef<[u8]> + AsMut<[u8]>>(page: &mut BTreePage<B>, slot: usize) {
    page.set_ghost(slot + 1, false);
}

/// Writes a new element into a ghost and clears its ghost bit.
pub fn replace_ghost<B: AsRef<[u8]> + AsMut<[u8]>>(
    page: &mut BTreePage<B>,
    slot: usize,
    element: &[u8],
) -> Result<()> {
    if !page.is_ghost(slot) {
        return Err(FosterError::Invalid("replace_ghost on a live record"));
    }
    page.replace_element(slot, element)?;
    unmark_ghost(page, slot);
    Ok(())
}

/// True when the ghost at `slot` already occupies enough bytes to hold
/// `element_len` without growing.
pub fn is_enough_spacious_ghost<B: AsRef<[u8]>>(
    page: &BTreePage<B>,
    slot: usize,
    element_len: usize,
) -> bool {
    let needed = leaf_record_len(page.trunc_key(slot).len(), element_len);
    page.is_ghost(slot) && page.item_state(slot + 1).len() >= needed
}

/// Ghost keys eligible for reclamation, skipping any the predicate
/// reports as locked (their owners may still roll back into them).
pub fn reclaimable_ghosts<B: AsRef<[u8]>>(
    page: &BTreePage<B>,
    is_locked: impl Fn(&[u8]) -> bool,
) -> Vec<KeyBuf> {
    (0..page.nrecs())
        .filter(|&slot| page.is_ghost(slot))
        .map(|slot| page.key(slot))
        .filter(|key| !is_locked(key))
        .collect()
}

/// Bytes that reclaiming `keys` would free, slots included.
pub fn reclaimable_space<B: AsRef<[u8]>>(page: &BTreePage<B>, keys: &[KeyBuf]) -> usize {
    keys.iter()
        .filter_map(|key| {
            let hit = super::search::search(page, key);
            (hit.found && page.is_ghost(hit.slot))
                .then(|| page.item_state(hit.slot + 1).len() + SLOT_LEN)
        })
        .sum()
}

/// Removes the ghost slots holding `keys` and compacts the heap. Keys that
/// are absent or live are left alone. Returns the number removed.
pub fn reclaim_ghosts<B, K>(page: &mut BTreePage<B>, keys: &[K]) -> usize
where
    B: AsRef<[u8]> + AsMut<[u8]>,
    K: AsRef<[u8]>,
{
    let mut removed = 0;
    for key in keys {
        let hit = super::search::search(page, key.as_ref());
        if hit.found && page.is_ghost(hit.slot) {
            page.delete_item(hit.slot + 1);
            removed += 1;
        }
    }
    page.compact();
    removed
}
