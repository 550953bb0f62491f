//! Structural modifications: foster split, adoption and root growth. Each
//! one is a single system log record applied to every page it touches
//! while all of them are latched exclusively.

use tracing::{debug, info};

use super::BTree;
use crate::primitives::pager::{LatchMode, PageHandle};
use crate::primitives::wal::LogRecord;
use crate::storage::btree::page::{node_record_len, BTreePage};
use crate::storage::btree::search::search_node;
use crate::storage::btree::split::{
    build_foster_child, chain_high_after_split, root_copy_image, suggest_fence_for_split,
};
use crate::types::{FosterError, PageId, Result};

impl BTree {
    /// Splits the exclusively latched `handle` to make room for `key` and
    /// returns whichever half now covers `key`, still latched.
    pub(crate) fn split_for(&self, mut handle: PageHandle, key: &[u8]) -> Result<PageHandle> {
        let source = handle.pid();
        let (point, chain_high, nrecs) = {
            let page = BTreePage::wrap(handle.data());
            let point = suggest_fence_for_split(
                &page,
                key,
                &self.options.split,
                self.options.max_records_per_page,
            )?;
            (point, chain_high_after_split(&page), page.nrecs())
        };
        let right_begins_from = u16::try_from(point.right_begins_from)
            .map_err(|_| FosterError::Invalid("split point does not fit the log record"))?;
        let new_pid = self.alloc.allocate_page()?;
        let new_image = build_foster_child(handle.data(), new_pid, point.right_begins_from, &point.mid)?;
        let record = LogRecord::FosterSplit {
            page: source,
            new_page: new_pid,
            right_begins_from,
            mid: point.mid.to_vec(),
            chain_high: chain_high.to_vec(),
            new_image,
        };
        let lsn = self.log.append(None, &record)?;
        let mut foster = self.store.fix(new_pid, LatchMode::Exclusive)?;
        self.apply_logged(&record, lsn, &mut foster)?;
        self.apply_logged(&record, lsn, &mut handle)?;

        let norecord = point.right_begins_from == nrecs;
        self.stats.inc_splits(norecord);
        info!(
            target: "fosterdb::btree::split",
            page = %source,
            foster = %new_pid,
            moved = nrecs - point.right_begins_from,
            norecord,
            lsn = lsn.0,
            "foster split"
        );
        if key >= point.mid.as_slice() {
            Ok(foster)
        } else {
            Ok(handle)
        }
    }

    /// Moves the foster child of `child` under `parent`. Returns `false`
    /// when nothing could be done right now (latches busy or the pages no
    /// longer line up) and `true` when the tree changed, which includes
    /// splitting a parent that had no room for the separator.
    pub(crate) fn adopt(&self, parent_pid: PageId, child_pid: PageId) -> Result<bool> {
        let Some(mut parent) = self.try_fix_exclusive(parent_pid)? else {
            return Ok(false);
        };
        let Some(mut child) = self.try_fix_exclusive(child_pid)? else {
            return Ok(false);
        };
        let (separator, foster, emlsn) = {
            let node = BTreePage::wrap(child.data());
            match node.foster_child() {
                Some((foster, emlsn)) => (node.fence_high(), foster, emlsn),
                None => return Ok(true),
            }
        };
        let needs_split = {
            let node = BTreePage::wrap(parent.data());
            let child_low = BTreePage::wrap(child.data()).fence_low().to_vec();
            let routes_child =
                !node.is_leaf() && node.child_at(search_node(&node, &child_low)) == child_pid.page;
            if !routes_child || !node.fence_contains(&separator) || node.belongs_to_foster(&separator) {
                return Ok(false);
            }
            let trunc_len = separator.len() - node.prefix_len();
            !self.has_room(&node, node_record_len(trunc_len))
        };
        if needs_split {
            drop(child);
            debug!(target: "fosterdb::btree::split", parent = %parent_pid, "parent full, splitting before adoption");
            self.split_for(parent, &separator)?;
            return Ok(true);
        }

        let new_child = child_pid.sibling(foster);
        let record = LogRecord::FosterAdopt {
            parent: parent_pid,
            child: child_pid,
            new_child_key: separator.to_vec(),
            new_child,
            new_child_emlsn: emlsn,
        };
        let lsn = self.log.append(None, &record)?;
        self.apply_logged(&record, lsn, &mut parent)?;
        self.apply_logged(&record, lsn, &mut child)?;
        self.stats.inc_adopts();
        debug!(
            target: "fosterdb::btree::split",
            parent = %parent_pid,
            child = %child_pid,
            adopted = %new_child,
            lsn = lsn.0,
            "foster child adopted"
        );
        Ok(true)
    }

    /// Pushes the root's content (and its foster chain) one level down so
    /// the root page id never changes. Returns `false` if the root had no
    /// foster child by the time it was latched.
    pub(crate) fn grow_tree(&self) -> Result<bool> {
        let mut root = self.store.fix(self.root, LatchMode::Exclusive)?;
        if BTreePage::wrap(root.data()).foster() == 0 {
            return Ok(false);
        }
        let new_child = self.alloc.allocate_page()?;
        let record = LogRecord::GrowTree {
            root: self.root,
            new_child,
            child_image: root_copy_image(root.data(), new_child)?,
        };
        let lsn = self.log.append(None, &record)?;
        let mut child = self.store.fix(new_child, LatchMode::Exclusive)?;
        self.apply_logged(&record, lsn, &mut child)?;
        self.apply_logged(&record, lsn, &mut root)?;
        self.stats.inc_grows();
        info!(
            target: "fosterdb::btree::split",
            root = %self.root,
            child = %new_child,
            level = BTreePage::wrap(root.data()).level(),
            lsn = lsn.0,
            "tree grew"
        );
        Ok(true)
    }

    fn try_fix_exclusive(&self, pid: PageId) -> Result<Option<PageHandle>> {
        match self.store.try_fix(pid, LatchMode::Exclusive) {
            Ok(handle) => Ok(Some(handle)),
            Err(FosterError::LockConflict) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
