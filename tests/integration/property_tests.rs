#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Bound;

use fosterdb::{BTree, BTreeOptions, FosterError, StorageEnv};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Operation {
    Insert(u16, Vec<u8>),
    Put(u16, Vec<u8>),
    Update(u16, Vec<u8>),
    Remove(u16),
    Lookup(u16),
}

fn arb_element() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..120)
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        4 => (0u16..400, arb_element()).prop_map(|(k, v)| Operation::Insert(k, v)),
        3 => (0u16..400, arb_element()).prop_map(|(k, v)| Operation::Put(k, v)),
        1 => (0u16..400, arb_element()).prop_map(|(k, v)| Operation::Update(k, v)),
        2 => (0u16..400).prop_map(Operation::Remove),
        1 => (0u16..400).prop_map(Operation::Lookup),
    ]
}

fn key_of(k: u16) -> String {
    format!("key-{k:05}")
}

fn new_tree(cap: Option<u16>, adopt_eagerly: bool) -> BTree {
    let options = BTreeOptions {
        page_size: 4096,
        max_records_per_page: cap,
        adopt_eagerly,
        verify_on_write: true,
        ..BTreeOptions::default()
    };
    let env = StorageEnv::in_memory(1, &options).unwrap();
    BTree::create(env, options).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_tree_matches_btreemap(
        ops in prop::collection::vec(arb_operation(), 1..400),
        cap in prop::option::of(3u16..12),
        adopt_eagerly in any::<bool>(),
    ) {
        let tree = new_tree(cap, adopt_eagerly);
        let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for op in ops {
            match op {
                Operation::Insert(k, v) => {
                    let key = key_of(k);
                    let result = tree.insert(key.as_str(), &v);
                    if model.contains_key(&key) {
                        prop_assert!(matches!(result, Err(FosterError::DuplicateKey)));
                    } else {
                        prop_assert!(result.is_ok());
                        model.insert(key, v);
                    }
                }
                Operation::Put(k, v) => {
                    let key = key_of(k);
                    prop_assert!(tree.put(key.as_str(), &v).is_ok());
                    model.insert(key, v);
                }
                Operation::Update(k, v) => {
                    let key = key_of(k);
                    let result = tree.update(key.as_str(), &v);
                    if let Some(slot) = model.get_mut(&key) {
                        prop_assert!(result.is_ok());
                        *slot = v;
                    } else {
                        prop_assert!(matches!(result, Err(FosterError::NotFound)));
                    }
                }
                Operation::Remove(k) => {
                    let key = key_of(k);
                    let result = tree.remove(key.as_str());
                    if model.remove(&key).is_some() {
                        prop_assert!(result.is_ok());
                    } else {
                        prop_assert!(matches!(result, Err(FosterError::NotFound)));
                    }
                }
                Operation::Lookup(k) => {
                    let key = key_of(k);
                    prop_assert_eq!(tree.lookup(key.as_str()).unwrap(), model.get(&key).cloned());
                    prop_assert_eq!(tree.lookup_optimistic(key.as_str()).unwrap(), model.get(&key).cloned());
                }
            }
        }

        let scanned: Vec<(Vec<u8>, Vec<u8>)> = tree.scan().collect_all().unwrap();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model
            .iter()
            .map(|(k, v)| (k.clone().into_bytes(), v.clone()))
            .collect();
        prop_assert_eq!(scanned, expected);

        let report = tree.verify().unwrap();
        prop_assert!(report.is_ok(), "{:?}", report.errors);
    }

    #[test]
    fn prop_range_matches_btreemap_range(
        keys in prop::collection::btree_set(0u64..5_000, 0..300),
        lo in 0u64..5_000,
        width in 0u64..2_000,
    ) {
        let tree = new_tree(Some(6), true);
        for key in &keys {
            tree.insert(key, &key.to_be_bytes()).unwrap();
        }
        let hi = lo + width;
        let mut cursor = tree.range(Bound::Included(&lo), Bound::Excluded(&hi));
        let mut got = Vec::new();
        while let Some((key, _)) = cursor.next_typed::<u64>().unwrap() {
            got.push(key);
        }
        let expected: Vec<u64> = keys.range(lo..hi).copied().collect();
        prop_assert_eq!(got, expected);
    }
}
