#![allow(missing_docs)]

use std::sync::Arc;

use fosterdb::primitives::concurrency::NoLocks;
use fosterdb::primitives::pager::MemPool;
use fosterdb::primitives::wal::{LogSink, MemoryLog};
use fosterdb::{BTree, BTreeOptions, Lsn, Result, StorageEnv};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const VOL: u32 = 3;

fn options() -> BTreeOptions {
    BTreeOptions {
        page_size: 4096,
        max_records_per_page: Some(7),
        ..BTreeOptions::default()
    }
}

fn workload(tree: &BTree, rng: &mut ChaCha8Rng, ops: usize) -> Result<()> {
    for _ in 0..ops {
        let key: u64 = rng.gen_range(0..500);
        match rng.gen_range(0..10) {
            0..=5 => tree.put(&key, &rng.gen::<u64>().to_le_bytes())?,
            6..=7 => match tree.remove(&key) {
                Ok(()) | Err(fosterdb::FosterError::NotFound) => {}
                Err(err) => return Err(err),
            },
            _ => match tree.overwrite(&key, 0, &[0xEE]) {
                Ok(()) | Err(fosterdb::FosterError::NotFound) => {}
                Err(err) => return Err(err),
            },
        }
    }
    Ok(())
}

fn contents(tree: &BTree) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    tree.scan().collect_all()
}

#[test]
fn redo_from_any_checkpoint_reaches_the_same_tree() -> Result<()> {
    let options = options();
    let pool = Arc::new(MemPool::new(VOL, options.page_size as usize)?);
    let log = Arc::new(MemoryLog::new());
    let tree = BTree::create(StorageEnv::new(pool.clone(), log.clone(), Arc::new(NoLocks)), options.clone())?;
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    workload(&tree, &mut rng, 800)?;
    let checkpoint_images = pool.page_images()?;
    let checkpoint_lsn = log.last_lsn();
    workload(&tree, &mut rng, 800)?;
    let expected = contents(&tree)?;
    let bytes = log.bytes();

    // replay everything onto the checkpoint: older changes are skipped
    let restored = Arc::new(MemPool::from_images(VOL, options.page_size as usize, checkpoint_images.clone())?);
    let env = StorageEnv::new(restored, Arc::new(MemoryLog::from_bytes(&bytes)), Arc::new(NoLocks));
    let (recovered, report) = BTree::recover(env.clone(), tree.root(), options.clone(), Lsn::ZERO)?;
    assert!(report.skipped > 0);
    assert!(report.applied > 0);
    assert_eq!(contents(&recovered)?, expected);
    assert!(recovered.verify()?.is_ok());

    // replaying again changes nothing
    let (again, second) = BTree::recover(env, tree.root(), options.clone(), Lsn::ZERO)?;
    assert_eq!(second.applied, 0);
    assert_eq!(contents(&again)?, expected);

    // starting just past the checkpoint is enough
    let restored = Arc::new(MemPool::from_images(VOL, options.page_size as usize, checkpoint_images)?);
    let env = StorageEnv::new(restored, Arc::new(MemoryLog::from_bytes(&bytes)), Arc::new(NoLocks));
    let (tail_only, tail) = BTree::recover(env, tree.root(), options, Lsn(checkpoint_lsn.0 + 1))?;
    assert_eq!(tail.skipped, 0);
    assert_eq!(contents(&tail_only)?, expected);
    Ok(())
}

#[test]
fn stale_pages_catch_up_from_the_log() -> Result<()> {
    let options = options();
    let pool = Arc::new(MemPool::new(VOL, options.page_size as usize)?);
    let log = Arc::new(MemoryLog::new());
    let tree = BTree::create(StorageEnv::new(pool.clone(), log.clone(), Arc::new(NoLocks)), options.clone())?;
    for key in 0..50u64 {
        tree.insert(&key, b"before")?;
    }
    let stale = pool.page_images()?;
    for key in 0..50u64 {
        tree.update(&key, b"after!")?;
    }

    let restored = Arc::new(MemPool::from_images(VOL, options.page_size as usize, stale)?);
    let env = StorageEnv::new(restored, Arc::new(MemoryLog::from_bytes(&log.bytes())), Arc::new(NoLocks));
    let (recovered, report) = BTree::recover(env, tree.root(), options, Lsn::ZERO)?;
    assert!(report.applied >= 50);
    for key in 0..50u64 {
        assert_eq!(recovered.lookup(&key)?, Some(b"after!".to_vec()));
    }
    Ok(())
}
