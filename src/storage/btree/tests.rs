use super::page::BTreePage;
use super::{BTree, StorageEnv};
use crate::config::BTreeOptions;
use crate::primitives::concurrency::NoLocks;
use crate::primitives::pager::{LatchMode, MemPool};
use crate::primitives::wal::MemoryLog;
use crate::types::{FosterError, Lsn, Result};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("fosterdb=warn,fosterdb::btree::split=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn capped(cap: u16) -> BTreeOptions {
    BTreeOptions {
        max_records_per_page: Some(cap),
        verify_on_write: true,
        ..BTreeOptions::default()
    }
}

fn tree_with(options: BTreeOptions) -> Result<(BTree, StorageEnv)> {
    init_tracing();
    let env = StorageEnv::in_memory(1, &options)?;
    let tree = BTree::create(env.clone(), options)?;
    Ok((tree, env))
}

fn scan_u64(tree: &BTree) -> Result<Vec<(u64, Vec<u8>)>> {
    let mut cursor = tree.scan();
    let mut out = Vec::new();
    while let Some(pair) = cursor.next_typed::<u64>()? {
        out.push(pair);
    }
    Ok(out)
}

#[test]
fn root_leaf_keeps_sorted_records_without_prefix() -> Result<()> {
    let (tree, env) = tree_with(BTreeOptions::default())?;
    tree.insert("cherry", b"3")?;
    tree.insert("apple", b"1")?;
    tree.insert("banana", b"2")?;

    let root = env.store.fix(tree.root(), LatchMode::Shared)?;
    let page = BTreePage::open(root.data())?;
    assert!(page.is_leaf());
    assert_eq!(page.nrecs(), 3);
    assert_eq!(page.prefix_len(), 0);
    let keys: Vec<_> = (0..3).map(|slot| page.key(slot)[1..].to_vec()).collect();
    assert_eq!(keys, vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]);
    drop(root);

    assert_eq!(tree.lookup("banana")?, Some(b"2".to_vec()));
    assert_eq!(tree.lookup("blueberry")?, None);
    Ok(())
}

#[test]
fn error_paths_leave_the_tree_untouched() -> Result<()> {
    let (tree, _env) = tree_with(BTreeOptions::default())?;
    tree.insert(&7u64, b"seven")?;
    assert!(matches!(tree.insert(&7u64, b"again"), Err(FosterError::DuplicateKey)));
    assert!(matches!(tree.update(&8u64, b"x"), Err(FosterError::NotFound)));
    assert!(matches!(tree.remove(&8u64), Err(FosterError::NotFound)));
    assert!(matches!(
        tree.overwrite(&7u64, 3, b"xyz"),
        Err(FosterError::RecordWontFit { len: 6, max: 5 })
    ));
    let huge = vec![0u8; tree.max_entry_size()];
    assert!(matches!(
        tree.insert(&9u64, &huge),
        Err(FosterError::RecordWontFit { .. })
    ));
    assert_eq!(tree.lookup(&7u64)?, Some(b"seven".to_vec()));
    assert!(tree.verify()?.is_ok());
    Ok(())
}

#[test]
fn largest_entry_fits() -> Result<()> {
    let (tree, _env) = tree_with(BTreeOptions::default())?;
    // keystr of a u64 is nine bytes
    let element = vec![0xA5; tree.max_entry_size() - 9];
    for key in 0..12u64 {
        tree.insert(&key, &element)?;
    }
    for key in 0..12u64 {
        assert_eq!(tree.lookup(&key)?.map(|e| e.len()), Some(element.len()));
    }
    assert!(tree.verify()?.is_ok());
    Ok(())
}

#[test]
fn ascending_load_uses_norecord_splits() -> Result<()> {
    let (tree, _env) = tree_with(capped(8))?;
    for key in (10..=10_000u64).step_by(10) {
        tree.insert(&key, &key.to_le_bytes())?;
    }
    let stats = tree.stats_snapshot();
    assert!(stats.norecord_splits >= 1, "{stats:?}");
    assert!(stats.grows >= 1);
    for key in (10..=10_000u64).step_by(10) {
        assert_eq!(tree.lookup(&key)?, Some(key.to_le_bytes().to_vec()));
        assert_eq!(tree.lookup(&(key + 1))?, None);
    }
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    assert_eq!(report.records, 1000);
    assert!(report.depth >= 3);
    Ok(())
}

#[test]
fn descending_and_random_loads_stay_consistent() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut keys: Vec<u64> = (0..600).collect();
    keys.shuffle(&mut rng);
    for order in [keys.clone(), (0..600).rev().collect::<Vec<_>>()] {
        let (tree, _env) = tree_with(capped(6))?;
        for key in &order {
            tree.insert(key, format!("v{key}").as_bytes())?;
        }
        let scanned = scan_u64(&tree)?;
        assert_eq!(scanned.len(), 600);
        assert!(scanned.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(tree.verify()?.is_ok());
    }
    Ok(())
}

#[test]
fn foster_chains_are_followed_without_adoption() -> Result<()> {
    let options = BTreeOptions {
        adopt_eagerly: false,
        ..capped(4)
    };
    let (tree, _env) = tree_with(options)?;
    for key in 0..200u64 {
        tree.insert(&key, b"x")?;
    }
    let stats = tree.stats_snapshot();
    assert_eq!(stats.adopts, 0);
    assert!(stats.foster_hops > 0);
    for key in 0..200u64 {
        assert_eq!(tree.lookup(&key)?, Some(b"x".to_vec()));
    }
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    assert!(report.foster_links > 0);
    Ok(())
}

#[test]
fn eager_adoption_shortens_chains() -> Result<()> {
    let (tree, _env) = tree_with(capped(4))?;
    for key in 0..200u64 {
        tree.insert(&key, b"x")?;
    }
    assert!(tree.stats_snapshot().adopts > 0);
    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    Ok(())
}

#[test]
fn removed_records_become_ghosts_then_get_reclaimed() -> Result<()> {
    let (tree, _env) = tree_with(BTreeOptions::default())?;
    let element = vec![1u8; 200];
    for key in 0..30u64 {
        tree.insert(&key, &element)?;
    }
    for key in 0..30u64 {
        tree.remove(&key)?;
    }
    let report = tree.verify()?;
    assert_eq!(report.ghosts, 30);
    assert_eq!(tree.lookup(&3u64)?, None);

    // re-inserting a removed key revives its ghost in place
    let defrags_before = tree.stats_snapshot().defrags;
    tree.insert(&3u64, b"back")?;
    assert_eq!(tree.lookup(&3u64)?, Some(b"back".to_vec()));
    let revived = tree.verify()?;
    assert_eq!(revived.records, report.records);
    assert_eq!(revived.ghosts, 29);
    assert_eq!(revived.pages, report.pages);
    assert_eq!(tree.stats_snapshot().defrags, defrags_before);

    let splits_before = tree.stats_snapshot().splits;
    for key in 100..130u64 {
        tree.insert(&key, &element)?;
    }
    let stats = tree.stats_snapshot();
    assert!(stats.defrags >= 1, "{stats:?}");
    assert!(stats.ghost_reclaims >= 1);
    assert_eq!(stats.splits, splits_before);
    assert!(tree.verify()?.is_ok());
    Ok(())
}

#[test]
fn put_and_update_resize_elements() -> Result<()> {
    let (tree, _env) = tree_with(capped(5))?;
    for key in 0..50u64 {
        tree.put(&key, b"s")?;
    }
    for key in 0..50u64 {
        tree.put(&key, &vec![key as u8; 300])?;
    }
    tree.update(&10u64, b"tiny")?;
    tree.overwrite(&10u64, 1, b"O")?;
    assert_eq!(tree.lookup(&10u64)?, Some(b"tOny".to_vec()));
    assert_eq!(tree.lookup(&11u64)?, Some(vec![11u8; 300]));
    assert!(tree.stats_snapshot().ghost_reserves >= 50);
    assert!(tree.verify()?.is_ok());
    Ok(())
}

#[test]
fn optimistic_lookup_agrees_with_latched_lookup() -> Result<()> {
    let (tree, _env) = tree_with(capped(5))?;
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let mut model = BTreeMap::new();
    for _ in 0..400 {
        let key: u64 = rng.gen_range(0..1000);
        let value = rng.gen::<u32>().to_be_bytes().to_vec();
        tree.put(&key, &value)?;
        model.insert(key, value);
    }
    for key in 0..1000u64 {
        let expected = model.get(&key).cloned();
        assert_eq!(tree.lookup_optimistic(&key)?, expected);
        assert_eq!(tree.lookup(&key)?, expected);
    }
    Ok(())
}

#[test]
fn recovery_replays_the_log_onto_blank_pages() -> Result<()> {
    init_tracing();
    let options = capped(6);
    let log = Arc::new(MemoryLog::new());
    let pool = Arc::new(MemPool::new(1, options.page_size as usize)?);
    let env = StorageEnv::new(pool, log.clone(), Arc::new(NoLocks));
    let tree = BTree::create(env, options.clone())?;
    for key in (0..300u64).rev() {
        tree.insert(&key, &key.to_be_bytes())?;
    }
    for key in (0..300u64).step_by(3) {
        tree.remove(&key)?;
    }
    let expected = scan_u64(&tree)?;

    let replayed = Arc::new(MemoryLog::from_bytes(&log.bytes()));
    let fresh = Arc::new(MemPool::new(1, options.page_size as usize)?);
    let env = StorageEnv::new(fresh, replayed, Arc::new(NoLocks));
    let (recovered, report) = BTree::recover(env.clone(), tree.root(), options.clone(), Lsn::ZERO)?;
    assert!(report.applied > 0);
    assert_eq!(report.skipped, 0);
    assert_eq!(scan_u64(&recovered)?, expected);
    assert!(recovered.verify()?.is_ok());

    // a second pass finds every page up to date
    let (_, again) = BTree::recover(env, tree.root(), options, Lsn::ZERO)?;
    assert_eq!(again.applied, 0);
    assert_eq!(again.skipped, report.applied);
    Ok(())
}
