//! Physical application of log records.
//!
//! [`apply`] is the single place where a logged change touches page bytes:
//! the forward path logs a record and then applies it, and recovery replays
//! the same function behind a per-page LSN gate. Both therefore produce the
//! same logical page.

use serde::Serialize;
use tracing::{debug, info};

use super::ghost;
use super::page::BTreePage;
use super::search::search;
use super::split::{adopt_into_parent, clear_foster, grow_root, shrink_source};
use crate::primitives::pager::{LatchMode, PageHandle, PageStore};
use crate::primitives::wal::{LogRecord, LogSink};
use crate::types::page::{page_lsn, set_page_lsn, PageHeader};
use crate::types::{FosterError, Lsn, PageId, Result};

/// Applies `record`'s effect on page `target` and stamps `lsn`.
pub fn apply(record: &LogRecord, target: PageId, page: &mut [u8], lsn: Lsn, skew_clamp: i16) -> Result<()> {
    match record {
        LogRecord::InsertNonGhost { key, element, .. } => {
            let mut leaf = BTreePage::wrap(&mut *page);
            let hit = search(&leaf, key);
            if !hit.found {
                leaf.insert_leaf_record(hit.slot, key, element, false, skew_clamp)?;
            } else if leaf.is_ghost(hit.slot) {
                ghost::replace_ghost(&mut leaf, hit.slot, element)?;
            }
        }
        LogRecord::Insert { key, element, .. } => {
            let mut leaf = BTreePage::wrap(&mut *page);
            let slot = existing_slot(&leaf, key)?;
            if !leaf.is_ghost(slot) {
                return Err(FosterError::Corruption("insert over a live record"));
            }
            ghost::replace_ghost(&mut leaf, slot, element)?;
        }
        LogRecord::GhostReserve { key, element_len, .. } => {
            let mut leaf = BTreePage::wrap(&mut *page);
            let hit = search(&leaf, key);
            if !hit.found {
                ghost::reserve_ghost(&mut leaf, hit.slot, key, *element_len as usize, skew_clamp)?;
            }
        }
        LogRecord::GhostMark { keys, .. } => {
            let mut leaf = BTreePage::wrap(&mut *page);
            for key in keys {
                let slot = existing_slot(&leaf, key)?;
                ghost::mark_ghost(&mut leaf, slot);
            }
        }
        LogRecord::GhostReclaim { keys, .. } => {
            let mut leaf = BTreePage::wrap(&mut *page);
            ghost::reclaim_ghosts(&mut leaf, keys);
        }
        LogRecord::Update { key, new, .. } => {
            let mut leaf = BTreePage::wrap(&mut *page);
            let slot = existing_slot(&leaf, key)?;
            leaf.replace_element(slot, new)?;
        }
        LogRecord::Overwrite { key, offset, new, .. } => {
            let mut leaf = BTreePage::wrap(&mut *page);
            let slot = existing_slot(&leaf, key)?;
            leaf.overwrite_element(slot, *offset as usize, new)?;
        }
        LogRecord::PageImageFormat { image, .. } => install_image(page, target, image)?,
        LogRecord::FosterSplit {
            page: source,
            new_page,
            right_begins_from,
            mid,
            chain_high,
            new_image,
        } => {
            if target == *new_page {
                install_image(page, target, new_image)?;
            } else if target == *source {
                let mut src = BTreePage::wrap(&mut *page);
                shrink_source(
                    &mut src,
                    new_page.page,
                    usize::from(*right_begins_from),
                    mid,
                    chain_high,
                    lsn,
                )?;
            } else {
                return Err(FosterError::Invalid("page not touched by foster split"));
            }
        }
        LogRecord::FosterAdopt {
            parent,
            child,
            new_child_key,
            new_child,
            new_child_emlsn,
        } => {
            if target == *parent {
                let mut node = BTreePage::wrap(&mut *page);
                adopt_into_parent(&mut node, new_child_key, new_child.page, *new_child_emlsn, skew_clamp)?;
            } else if target == *child {
                clear_foster(&mut BTreePage::wrap(&mut *page))?;
            } else {
                return Err(FosterError::Invalid("page not touched by adoption"));
            }
        }
        LogRecord::GrowTree {
            root,
            new_child,
            child_image,
        } => {
            if target == *new_child {
                install_image(page, target, child_image)?;
            } else if target == *root {
                grow_root(&mut BTreePage::wrap(&mut *page), new_child.page, lsn)?;
            } else {
                return Err(FosterError::Invalid("page not touched by tree growth"));
            }
        }
    }
    set_page_lsn(page, lsn);
    Ok(())
}

fn existing_slot<B: AsRef<[u8]>>(leaf: &BTreePage<B>, key: &[u8]) -> Result<usize> {
    let hit = search(leaf, key);
    if hit.found {
        Ok(hit.slot)
    } else {
        Err(FosterError::Corruption("log record names a key missing from its page"))
    }
}

fn install_image(page: &mut [u8], target: PageId, image: &[u8]) -> Result<()> {
    if image.len() != page.len() {
        return Err(FosterError::Corruption("page image has the wrong size"));
    }
    if PageHeader::decode(image)?.pid != target {
        return Err(FosterError::Corruption("page image belongs to another page"));
    }
    page.copy_from_slice(image);
    Ok(())
}

/// Outcome of a redo pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RedoReport {
    /// Page changes re-applied.
    pub applied: u64,
    /// Page changes skipped because the page was already newer.
    pub skipped: u64,
    /// Highest LSN seen.
    pub last_lsn: Lsn,
}

/// Replays every log entry at or after `from` against `store`. Pages the
/// store has never seen are created blank first.
pub fn redo_all(store: &dyn PageStore, log: &dyn LogSink, from: Lsn, skew_clamp: i16) -> Result<RedoReport> {
    let mut report = RedoReport::default();
    for entry in log.read_from(from)? {
        for pid in entry.record.pages() {
            let mut handle = fix_for_redo(store, pid)?;
            if page_lsn(handle.data()) >= entry.lsn {
                report.skipped += 1;
                continue;
            }
            apply(&entry.record, pid, handle.data_mut()?, entry.lsn, skew_clamp)?;
            debug!(
                target: "fosterdb::btree::redo",
                lsn = entry.lsn.0,
                page = %pid,
                kind = entry.record.kind_name(),
                "redo applied"
            );
            report.applied += 1;
        }
        report.last_lsn = entry.lsn;
    }
    info!(
        target: "fosterdb::btree::redo",
        applied = report.applied,
        skipped = report.skipped,
        last_lsn = report.last_lsn.0,
        "redo pass complete"
    );
    Ok(report)
}

fn fix_for_redo(store: &dyn PageStore, pid: PageId) -> Result<PageHandle> {
    match store.fix(pid, LatchMode::Exclusive) {
        Err(FosterError::PageNotFound(_)) => store.fix_virgin(pid),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::format::{format, FormatParams};
    use crate::storage::btree::key::KeyStr;

    fn blank_leaf() -> Result<Vec<u8>> {
        let mut page = BTreePage::wrap(vec![0u8; 1024]);
        format(
            &mut page,
            &FormatParams::leaf(
                PageId::new(1, 1),
                1,
                KeyStr::neg_infinity().as_bytes(),
                KeyStr::pos_infinity().as_bytes(),
            ),
        )?;
        Ok(page.into_inner())
    }

    fn gated(record: &LogRecord, page: &mut [u8], lsn: Lsn) -> Result<()> {
        if page_lsn(page) < lsn {
            apply(record, PageId::new(1, 1), page, lsn, 100)?;
        }
        Ok(())
    }

    #[test]
    fn gated_redo_is_idempotent() -> Result<()> {
        let pid = PageId::new(1, 1);
        let records = [
            LogRecord::InsertNonGhost {
                page: pid,
                key: KeyStr::encode("a").as_bytes().to_vec(),
                element: b"one".to_vec(),
            },
            LogRecord::GhostReserve {
                page: pid,
                key: KeyStr::encode("b").as_bytes().to_vec(),
                element_len: 3,
            },
            LogRecord::Insert {
                page: pid,
                key: KeyStr::encode("b").as_bytes().to_vec(),
                element: b"two".to_vec(),
                prior: vec![0; 3],
            },
            LogRecord::Update {
                page: pid,
                key: KeyStr::encode("a").as_bytes().to_vec(),
                old: b"one".to_vec(),
                new: b"uno".to_vec(),
            },
            LogRecord::GhostMark {
                page: pid,
                keys: vec![KeyStr::encode("b").as_bytes().to_vec()],
            },
        ];
        let mut once = blank_leaf()?;
        let mut twice = blank_leaf()?;
        for (i, record) in records.iter().enumerate() {
            let lsn = Lsn(i as u64 + 1);
            gated(record, &mut once, lsn)?;
            gated(record, &mut twice, lsn)?;
            gated(record, &mut twice, lsn)?;
        }
        assert_eq!(once, twice);
        let leaf = BTreePage::open(once.as_slice())?;
        assert_eq!(leaf.lsn(), Lsn(5));
        assert_eq!(leaf.element(0), b"uno");
        assert!(leaf.is_ghost(1));
        Ok(())
    }

    #[test]
    fn image_for_wrong_page_is_rejected() -> Result<()> {
        let image = blank_leaf()?;
        let mut page = vec![0u8; 1024];
        let record = LogRecord::PageImageFormat {
            page: PageId::new(1, 2),
            image,
        };
        let err = apply(&record, PageId::new(1, 2), &mut page, Lsn(1), 100);
        assert!(matches!(err, Err(FosterError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn missing_key_is_corruption() -> Result<()> {
        let mut page = blank_leaf()?;
        let record = LogRecord::Overwrite {
            page: PageId::new(1, 1),
            key: KeyStr::encode("zz").as_bytes().to_vec(),
            offset: 0,
            old: vec![1],
            new: vec![2],
        };
        assert!(apply(&record, PageId::new(1, 1), &mut page, Lsn(1), 100).is_err());
        Ok(())
    }
}
