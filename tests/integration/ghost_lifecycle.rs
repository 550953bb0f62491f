#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fosterdb::{BTree, BTreeOptions, FosterError, Result, StorageEnv};

fn tree_with_short_waits() -> Result<BTree> {
    let options = BTreeOptions {
        lock_wait_ms: 20,
        max_lock_retries: 2,
        ..BTreeOptions::default()
    };
    BTree::create(StorageEnv::in_memory(1, &options)?, options)
}

#[test]
fn deleted_key_stays_reserved_until_commit() -> Result<()> {
    let tree = tree_with_short_waits()?;
    tree.insert("k", b"v1")?;

    let deleter = tree.begin();
    tree.remove_with(&deleter, "k")?;
    assert_eq!(tree.verify()?.ghosts, 1);

    let inserter = tree.begin();
    let blocked = tree.insert_with(&inserter, "k", b"v2");
    assert!(matches!(blocked, Err(FosterError::RetryExhausted(2))), "{blocked:?}");

    tree.commit(&deleter)?;
    tree.insert_with(&inserter, "k", b"v2")?;
    tree.commit(&inserter)?;
    assert_eq!(tree.lookup("k")?, Some(b"v2".to_vec()));
    assert_eq!(tree.verify()?.ghosts, 0);
    Ok(())
}

#[test]
fn rollback_revives_removed_records() -> Result<()> {
    let tree = tree_with_short_waits()?;
    for key in 0..10u64 {
        tree.insert(&key, &[key as u8; 4])?;
    }
    let xct = tree.begin();
    for key in (0..10u64).filter(|k| k % 2 == 0) {
        tree.remove_with(&xct, &key)?;
    }
    assert_eq!(tree.lookup(&4u64)?, None);
    tree.rollback(&xct)?;
    for key in 0..10u64 {
        assert_eq!(tree.lookup(&key)?, Some(vec![key as u8; 4]));
    }
    Ok(())
}

#[test]
fn locked_ghosts_survive_defragmentation() -> Result<()> {
    let tree = tree_with_short_waits()?;
    let element = vec![7u8; 300];
    // scattered order keeps the leaf clear of no-record splits
    for i in 0..24u64 {
        tree.insert(&((i * 7) % 24), &element)?;
    }
    let holder = tree.begin();
    tree.remove_with(&holder, &0u64)?;
    for key in 1..24u64 {
        tree.remove(&key)?;
    }
    assert_eq!(tree.verify()?.ghosts, 24);

    // refill the same leaf so it has to reclaim space
    for k in 0..20u64 {
        tree.insert(&(k * 10 + 5), &element)?;
    }
    let stats = tree.stats_snapshot();
    assert!(stats.defrags >= 1, "{stats:?}");
    assert!(stats.ghost_reclaims >= 1, "{stats:?}");
    assert_eq!(stats.splits, 0, "{stats:?}");
    let report = tree.verify()?;
    assert_eq!(report.ghosts, 1, "only the locked ghost is left");
    assert_eq!(report.records, 21);

    // the locked ghost is still there for the rollback to revive
    tree.rollback(&holder)?;
    assert_eq!(tree.lookup(&0u64)?, Some(element));
    assert!(tree.verify()?.is_ok());
    Ok(())
}

#[test]
fn waiting_writer_proceeds_after_release() -> Result<()> {
    let options = BTreeOptions {
        lock_wait_ms: 2_000,
        ..BTreeOptions::default()
    };
    let tree = Arc::new(BTree::create(StorageEnv::in_memory(1, &options)?, options)?);
    tree.insert(&1u64, b"old")?;
    let first = tree.begin();
    tree.update_with(&first, &1u64, b"first")?;

    let waiter = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || -> Result<()> {
            tree.transact(|xct| tree.update_with(xct, &1u64, b"second"))
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(tree.lookup(&1u64)?, Some(b"first".to_vec()));
    tree.commit(&first)?;
    waiter.join().expect("waiter thread panicked")?;
    assert_eq!(tree.lookup(&1u64)?, Some(b"second".to_vec()));
    Ok(())
}
