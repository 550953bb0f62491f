#![allow(missing_docs)]

use std::io::Write;
use std::ops::Bound;

use fosterdb::storage::btree::split::{build_foster_child, suggest_fence_for_split};
use fosterdb::storage::btree::page::BTreePage;
use fosterdb::storage::btree::KeyStr;
use fosterdb::{BTree, BTreeOptions, Result, SplitTuning, StorageEnv};

fn tree(options: BTreeOptions) -> Result<BTree> {
    BTree::create(StorageEnv::in_memory(1, &options)?, options)
}

#[test]
fn appending_keys_fills_pages_with_norecord_splits() -> Result<()> {
    let options = BTreeOptions {
        max_records_per_page: Some(8),
        ..BTreeOptions::default()
    };
    let tree = tree(options)?;
    for key in (10..=10_000u64).step_by(10) {
        tree.insert(&key, format!("{key}").as_bytes())?;
    }

    let stats = tree.stats_snapshot();
    assert!(stats.norecord_splits >= 1);
    assert!(stats.splits >= stats.norecord_splits);
    for key in (10..=10_000u64).step_by(10) {
        assert_eq!(tree.lookup(&key)?, Some(format!("{key}").into_bytes()));
    }

    let report = tree.verify()?;
    assert!(report.is_ok(), "{:?}", report.errors);
    // no-record splits leave full pages behind: nearly every leaf holds
    // cap - 1 records
    assert!(report.leaves <= 1000 / 6, "{} leaves", report.leaves);
    Ok(())
}

#[test]
fn split_keeps_range_scans_complete() -> Result<()> {
    let options = BTreeOptions {
        max_records_per_page: Some(5),
        ..BTreeOptions::default()
    };
    let tree = tree(options)?;
    let words = [
        "kiwi", "apple", "mango", "banana", "cherry", "plum", "fig", "grape", "lemon", "lime",
        "date", "pear", "peach", "quince", "melon", "orange", "papaya", "guava",
    ];
    for word in words {
        tree.insert(word, word.as_bytes())?;
    }
    let mut sorted = words.to_vec();
    sorted.sort_unstable();

    let all: Vec<String> = tree
        .scan()
        .collect_all()?
        .into_iter()
        .map(|(key, _)| String::from_utf8_lossy(&key).into_owned())
        .collect();
    assert_eq!(all, sorted);

    let middle = tree
        .range(Bound::Included("date"), Bound::Excluded("melon"))
        .collect_all()?;
    let expected: Vec<&str> = sorted
        .iter()
        .copied()
        .filter(|w| *w >= "date" && *w < "melon")
        .collect();
    assert_eq!(middle.len(), expected.len());
    Ok(())
}

#[test]
fn page_level_split_moves_the_upper_range() -> Result<()> {
    let options = BTreeOptions::default();
    let tree = tree(options.clone())?;
    for key in 0..20u64 {
        tree.insert(&key, b"element")?;
    }
    let env_page = {
        // rebuild the leaf image from a scan so the test only uses public API
        let env = StorageEnv::in_memory(2, &options)?;
        let copy = BTree::create(env.clone(), options.clone())?;
        for (key, element) in tree.scan().collect_all()? {
            copy.insert(&key, &element)?;
        }
        let handle = env.store.fix(copy.root(), fosterdb::primitives::pager::LatchMode::Shared)?;
        handle.data().to_vec()
    };
    let page = BTreePage::open(env_page.as_slice())?;
    let probe = KeyStr::encode(&7u64);
    let point = suggest_fence_for_split(&page, probe.as_bytes(), &SplitTuning::default(), None)?;
    assert!(point.right_begins_from > 0 && point.right_begins_from < 20);

    let new_pid = page.pid().sibling(99);
    let image = build_foster_child(&env_page, new_pid, point.right_begins_from, &point.mid)?;
    let child = BTreePage::open(image.as_slice())?;
    assert_eq!(child.nrecs(), 20 - point.right_begins_from);
    assert_eq!(child.fence_low(), point.mid.as_slice());
    assert!(child.check_invariants().is_ok());
    Ok(())
}

#[test]
fn options_load_from_toml_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "max_records_per_page = 6\nadopt_eagerly = false\n[split]\nskew_bias_percent = 75")?;
    let options = BTreeOptions::load(file.path())?;
    assert_eq!(options.max_records_per_page, Some(6));
    let tree = tree(options)?;
    for key in 0..100i64 {
        tree.insert(&(key - 50), b"v")?;
    }
    assert_eq!(tree.stats_snapshot().adopts, 0);
    assert!(tree.verify()?.is_ok());
    Ok(())
}
