#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;

use fosterdb::{BTree, BTreeOptions, Result, StorageEnv};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const NUM_THREADS: usize = 6;
const KEYS_PER_THREAD: u64 = 400;

fn shared_tree(cap: Option<u16>) -> Result<Arc<BTree>> {
    let options = BTreeOptions {
        max_records_per_page: cap,
        lock_wait_ms: 1_000,
        max_lock_retries: 1_000,
        ..BTreeOptions::default()
    };
    Ok(Arc::new(BTree::create(StorageEnv::in_memory(1, &options)?, options)?))
}

#[test]
fn concurrent_disjoint_inserts() -> Result<()> {
    let tree = shared_tree(Some(8))?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let mut handles = vec![];

    for thread_id in 0..NUM_THREADS as u64 {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> Result<()> {
            let mut keys: Vec<u64> = (0..KEYS_PER_THREAD)
                .map(|i| i * NUM_THREADS as u64 + thread_id)
                .collect();
            keys.shuffle(&mut ChaCha8Rng::seed_from_u64(thread_id));
            barrier.wait();
            for key in keys {
                tree.insert(&key, &key.to_be_bytes())?;
            }
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }

    let total = NUM_THREADS as u64 * KEYS_PER_THREAD;
    for key in 0..total {
        assert_eq!(tree.lookup(&key)?, Some(key.to_be_bytes().to_vec()));
    }
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.records as u64, total);
    Ok(())
}

#[test]
fn readers_see_consistent_values_during_writes() -> Result<()> {
    let tree = shared_tree(Some(6))?;
    for key in 0..500u64 {
        tree.insert(&key, &[0u8; 8])?;
    }
    let barrier = Arc::new(Barrier::new(3));

    let writer = {
        let tree = Arc::clone(&tree);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || -> Result<()> {
            barrier.wait();
            for round in 1..=4u8 {
                for key in 0..500u64 {
                    tree.put(&key, &[round; 8])?;
                }
                for key in 500..600u64 {
                    tree.put(&(key + u64::from(round) * 100), &[round; 8])?;
                }
            }
            Ok(())
        })
    };
    let readers: Vec<_> = [false, true]
        .into_iter()
        .map(|optimistic| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for _ in 0..4 {
                    for key in 0..500u64 {
                        let value = if optimistic {
                            tree.lookup_optimistic(&key)?
                        } else {
                            tree.lookup(&key)?
                        };
                        let value = value.expect("preloaded key vanished");
                        assert_eq!(value.len(), 8);
                        assert!(value.iter().all(|b| *b == value[0]), "torn element {value:?}");
                    }
                }
                Ok(())
            })
        })
        .collect();

    writer.join().unwrap()?;
    for reader in readers {
        reader.join().unwrap()?;
    }
    assert!(tree.verify()?.is_ok());
    Ok(())
}

#[test]
fn transactions_on_shared_keys_serialize() -> Result<()> {
    let tree = shared_tree(None)?;
    tree.insert("counter", &0u64.to_be_bytes())?;
    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let tree = Arc::clone(&tree);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for _ in 0..25 {
                    tree.transact(|xct| {
                        // exclusive lock first so read-modify-write cannot interleave
                        tree.overwrite_with(xct, "counter", 0, &[0])?;
                        let current = tree.lookup_with(xct, "counter")?.unwrap_or_default();
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&current);
                        raw[0] = 0;
                        let next = u64::from_be_bytes(raw) + 1;
                        tree.update_with(xct, "counter", &next.to_be_bytes())
                    })?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap()?;
    }
    assert_eq!(tree.lookup("counter")?, Some(100u64.to_be_bytes().to_vec()));
    Ok(())
}
