use tracing::{debug, info};

use super::BTree;
use crate::primitives::concurrency::Xct;
use crate::primitives::pager::LatchMode;
use crate::primitives::wal::LogRecord;
use crate::storage::btree::page::BTreePage;
use crate::storage::btree::search::search;
use crate::types::{FosterError, Result};

impl BTree {
    /// Starts a locking transaction.
    pub fn begin(&self) -> Xct {
        let xct = Xct::new(self.next_txn_id(), true);
        debug!(target: "fosterdb::btree::txn", txn = xct.id().0, "begin");
        xct
    }

    /// Releases every lock `xct` holds. Its changes are already applied.
    pub fn commit(&self, xct: &Xct) -> Result<()> {
        self.locks.release_all(xct.id());
        debug!(target: "fosterdb::btree::txn", txn = xct.id().0, "commit");
        Ok(())
    }

    /// Undoes the changes `xct` logged, newest first, then releases its
    /// locks. Compensations are system changes and are never undone
    /// themselves. Returns the number of records undone.
    pub fn rollback(&self, xct: &Xct) -> Result<usize> {
        let entries = self.log.entries_for(xct.id())?;
        let system = Xct::system();
        for entry in entries.iter().rev() {
            self.retry_on_lock_conflict(|| self.compensate(&system, &entry.record))?;
        }
        self.locks.release_all(xct.id());
        info!(
            target: "fosterdb::btree::txn",
            txn = xct.id().0,
            undone = entries.len(),
            "rollback"
        );
        Ok(entries.len())
    }

    /// Runs `body` in a fresh transaction, committing on success and
    /// rolling back on error.
    pub fn transact<T>(&self, body: impl FnOnce(&Xct) -> Result<T>) -> Result<T> {
        let xct = self.begin();
        match body(&xct) {
            Ok(value) => {
                self.commit(&xct)?;
                Ok(value)
            }
            Err(err) => {
                self.rollback(&xct)?;
                Err(err)
            }
        }
    }

    fn compensate(&self, system: &Xct, record: &LogRecord) -> Result<()> {
        let undone = match record {
            LogRecord::InsertNonGhost { key, .. } | LogRecord::Insert { key, .. } => {
                self.remove_once(system, key)
            }
            LogRecord::GhostMark { keys, .. } => keys.iter().try_for_each(|key| self.unmark_once(key)),
            LogRecord::Update { key, old, .. } => self.update_once(system, key, old),
            LogRecord::Overwrite { key, offset, old, .. } => self.overwrite_once(system, key, *offset, old),
            _ => return Err(FosterError::Invalid("structural records are not undone")),
        };
        match undone {
            Err(FosterError::NotFound) => Err(FosterError::Corruption("undo target is missing")),
            other => other,
        }
    }

    /// Revives the ghost holding `key` with the element it still carries.
    fn unmark_once(&self, key: &[u8]) -> Result<()> {
        let mut leaf = self.traverse(key, LatchMode::Exclusive)?;
        let element = {
            let page = BTreePage::wrap(leaf.data());
            let hit = search(&page, key);
            if !hit.found || !page.is_ghost(hit.slot) {
                return Err(FosterError::NotFound);
            }
            page.element(hit.slot).to_vec()
        };
        let record = LogRecord::InsertNonGhost {
            page: leaf.pid(),
            key: key.to_vec(),
            element,
        };
        self.log_apply(None, &record, &mut leaf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BTreeOptions;
    use crate::storage::btree::tree::{BTree, StorageEnv};
    use crate::types::{FosterError, Result};

    fn tree() -> Result<BTree> {
        let options = BTreeOptions::default();
        BTree::create(StorageEnv::in_memory(1, &options)?, options)
    }

    #[test]
    fn rollback_restores_every_kind_of_change() -> Result<()> {
        let tree = tree()?;
        tree.insert(&1u64, b"one")?;
        tree.insert(&2u64, b"two")?;
        tree.insert(&3u64, b"three")?;

        let xct = tree.begin();
        tree.insert_with(&xct, &4u64, b"four")?;
        tree.put_with(&xct, &5u64, b"five")?;
        tree.update_with(&xct, &1u64, b"uno, much longer now")?;
        tree.overwrite_with(&xct, &3u64, 0, b"TH")?;
        tree.remove_with(&xct, &2u64)?;
        assert_eq!(tree.lookup(&3u64)?, Some(b"THree".to_vec()));
        assert_eq!(tree.rollback(&xct)?, 5);

        assert_eq!(tree.lookup(&1u64)?, Some(b"one".to_vec()));
        assert_eq!(tree.lookup(&2u64)?, Some(b"two".to_vec()));
        assert_eq!(tree.lookup(&3u64)?, Some(b"three".to_vec()));
        assert_eq!(tree.lookup(&4u64)?, None);
        assert_eq!(tree.lookup(&5u64)?, None);
        Ok(())
    }

    #[test]
    fn transact_commits_or_rolls_back() -> Result<()> {
        let tree = tree()?;
        tree.transact(|xct| tree.insert_with(xct, "kept", b"1"))?;
        let failed: Result<()> = tree.transact(|xct| {
            tree.insert_with(xct, "dropped", b"2")?;
            tree.insert_with(xct, "kept", b"dup")
        });
        assert!(matches!(failed, Err(FosterError::DuplicateKey)));
        assert_eq!(tree.lookup("kept")?, Some(b"1".to_vec()));
        assert_eq!(tree.lookup("dropped")?, None);
        Ok(())
    }
}
