//! Whole-tree consistency check.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

use super::BTree;
use crate::primitives::pager::LatchMode;
use crate::storage::btree::key::{KeyBuf, KeyStr};
use crate::storage::btree::page::BTreePage;
use crate::types::{Lsn, PageId, Result};

/// What [`BTree::verify`] saw.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    /// Pages visited.
    pub pages: usize,
    /// Leaf pages visited.
    pub leaves: usize,
    /// Leaf records, ghosts included.
    pub records: usize,
    /// Ghost records.
    pub ghosts: usize,
    /// Level of the root.
    pub depth: u16,
    /// Foster links followed.
    pub foster_links: usize,
    /// One line per violation found.
    pub errors: Vec<String>,
}

impl VerifyReport {
    /// No violations.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Expect<'a> {
    low: &'a [u8],
    high: &'a [u8],
    level: u16,
    emlsn: Lsn,
}

impl BTree {
    /// Walks every page reachable from the root and checks page
    /// invariants, levels, fence continuity along real and foster edges,
    /// and that no child is older than the LSN its parent expects.
    ///
    /// Pages are copied under a shared latch one at a time, so the result
    /// is only meaningful on a quiescent tree.
    pub fn verify(&self) -> Result<VerifyReport> {
        let depth = BTreePage::wrap(self.store.fix(self.root, LatchMode::Shared)?.data()).level();
        let mut report = VerifyReport {
            depth,
            ..VerifyReport::default()
        };
        let mut visited = HashSet::new();
        let low = KeyStr::neg_infinity();
        let high = KeyStr::pos_infinity();
        let expect = Expect {
            low: low.as_bytes(),
            high: high.as_bytes(),
            level: depth,
            emlsn: Lsn::ZERO,
        };
        self.verify_chain(self.root, &expect, &mut visited, &mut report)?;
        if report.is_ok() {
            info!(
                target: "fosterdb::btree::verify",
                pages = report.pages,
                records = report.records,
                depth = report.depth,
                "tree verified"
            );
        } else {
            warn!(
                target: "fosterdb::btree::verify",
                errors = report.errors.len(),
                first = %report.errors[0],
                "tree verification failed"
            );
        }
        Ok(report)
    }

    fn verify_chain(
        &self,
        head: PageId,
        expect: &Expect<'_>,
        visited: &mut HashSet<PageId>,
        report: &mut VerifyReport,
    ) -> Result<()> {
        let mut pid = head;
        let mut expected_low = KeyBuf::from_slice(expect.low);
        let mut emlsn = expect.emlsn;
        loop {
            if !visited.insert(pid) {
                report.errors.push(format!("{pid}: reached twice"));
                return Ok(());
            }
            let image = self.store.fix(pid, LatchMode::Shared)?.data().to_vec();
            let page = match BTreePage::open(image.as_slice()) {
                Ok(page) => page,
                Err(err) => {
                    report.errors.push(format!("{pid}: {err}"));
                    return Ok(());
                }
            };
            report.pages += 1;
            if let Err(err) = page.check_invariants() {
                report.errors.push(format!("{pid}: {err}"));
            }
            if page.level() != expect.level {
                report
                    .errors
                    .push(format!("{pid}: level {} where {} expected", page.level(), expect.level));
            }
            if page.fence_low() != expected_low.as_slice() {
                report.errors.push(format!("{pid}: low fence does not continue its neighbour"));
            }
            if page.lsn() < emlsn {
                report
                    .errors
                    .push(format!("{pid}: lsn {} older than expected {}", page.lsn().0, emlsn.0));
            }
            let this_high = page.fence_high();
            let foster = page.foster_child();
            match foster {
                Some(_) => {
                    if page.chain_high() != Some(expect.high) {
                        report.errors.push(format!("{pid}: chain-high does not match the range end"));
                    }
                    if this_high.as_slice() >= expect.high {
                        report.errors.push(format!("{pid}: foster parent reaches the range end"));
                        return Ok(());
                    }
                }
                None => {
                    if this_high.as_slice() != expect.high {
                        report.errors.push(format!("{pid}: high fence does not close the range"));
                    }
                }
            }

            if page.is_leaf() {
                report.leaves += 1;
                report.records += page.nrecs();
                report.ghosts += page.ghost_count();
            } else {
                self.verify_children(&page, &this_high, expect.level, visited, report)?;
            }

            match foster {
                Some((next, next_emlsn)) => {
                    report.foster_links += 1;
                    expected_low = this_high;
                    emlsn = next_emlsn;
                    pid = pid.sibling(next);
                }
                None => return Ok(()),
            }
        }
    }

    fn verify_children(
        &self,
        page: &BTreePage<&[u8]>,
        high: &[u8],
        level: u16,
        visited: &mut HashSet<PageId>,
        report: &mut VerifyReport,
    ) -> Result<()> {
        let pid = page.pid();
        let nrecs = page.nrecs();
        let mut low = KeyBuf::from_slice(page.fence_low());
        let mut child = (page.pid0(), page.pid0_emlsn());
        for slot in 0..=nrecs {
            let child_high = if slot < nrecs { page.key(slot) } else { KeyBuf::from_slice(high) };
            let expect = Expect {
                low: &low,
                high: &child_high,
                level: level - 1,
                emlsn: child.1,
            };
            self.verify_chain(pid.sibling(child.0), &expect, visited, report)?;
            if slot < nrecs {
                child = (page.child(slot), page.child_emlsn(slot));
                low = child_high;
            }
        }
        Ok(())
    }
}
