use rand::{prelude::random, rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};

use std::{collections::BTreeMap, sync::Arc, thread};

use super::*;
use crate::{buffer::HeapFactory, store::BlobStore, Config};

fn new_tree(name: &str) -> BPlusTree<u64, u64, 4> {
    HeapFactory::unlink(name);
    let factory: Arc<dyn crate::buffer::BufferFactory> = Arc::new(HeapFactory::new());
    let store = Arc::new(BlobStore::create(factory, Config::new(name)).unwrap());
    BPlusTree::create(store).unwrap()
}

#[test]
fn test_tree_empty() {
    let tree = new_tree("test_tree_empty");
    assert!(tree.get(&1).unwrap().is_none());
    assert_eq!(tree.iter().unwrap().count(), 0);

    let stats = tree.validate().unwrap();
    assert_eq!(stats.n_entries, 0);
    assert_eq!(stats.height, 1);
}

#[test]
fn test_tree_sequential() {
    let tree = new_tree("test_tree_sequential");
    for k in 0..100_u64 {
        tree.set(k, 100 * k).unwrap();
    }

    for k in 0..100_u64 {
        assert_eq!(*tree.get(&k).unwrap().unwrap(), 100 * k, "key {}", k);
    }
    assert!(tree.get(&100).unwrap().is_none());

    // leaves iterate in key order.
    let keys: Vec<u64> = tree.iter().unwrap().map(|(k, _)| *k).collect();
    assert_eq!(keys, (0..100).collect::<Vec<u64>>());

    let stats = tree.validate().unwrap();
    assert_eq!(stats.n_entries, 100);
    assert!(stats.height >= 3);
}

#[test]
fn test_tree_search_range() {
    let tree = new_tree("test_tree_search_range");
    for k in 0..50_u64 {
        tree.set(2 * k, k).unwrap();
    }

    // first key at or above the probe.
    let iter = tree.search(&31).unwrap();
    assert_eq!(*iter.key().unwrap(), 32);
    let rest: Vec<u64> = iter.map(|(k, _)| *k).collect();
    assert_eq!(rest, (16..50).map(|k| 2 * k).collect::<Vec<u64>>());
}

#[test]
fn test_tree_random_delete() {
    let tree = new_tree("test_tree_random_delete");
    for k in 0..100_u64 {
        tree.set(k, 100 * k).unwrap();
    }

    for k in [0_u64, 3, 7, 42, 99].iter() {
        let deleted = tree.remove(k).unwrap().unwrap();
        assert_eq!(*deleted, 100 * k);
    }

    for k in 0..100_u64 {
        match k {
            0 | 3 | 7 | 42 | 99 => assert!(tree.get(&k).unwrap().is_none(), "key {}", k),
            _ => assert_eq!(*tree.get(&k).unwrap().unwrap(), 100 * k, "key {}", k),
        }
    }
    let stats = tree.validate().unwrap();
    assert_eq!(stats.n_entries, 95);

    // removing a missing key is a clean no-op.
    assert!(tree.remove(&3).unwrap().is_none());
    assert_eq!(tree.validate().unwrap().n_entries, 95);
}

#[test]
fn test_tree_mvcc_snapshot() {
    let tree = new_tree("test_tree_mvcc");

    let mut txn_a = tree.transaction().unwrap();
    txn_a.insert(1, 10).unwrap();
    assert!(txn_a.commit().unwrap());

    // B captures the head before C commits.
    let txn_b = tree.transaction().unwrap();

    let mut txn_c = tree.transaction().unwrap();
    txn_c.insert(2, 20).unwrap();
    assert!(txn_c.commit().unwrap());

    // B's snapshot still shows the old version ...
    let keys_b: Vec<u64> = txn_b.iter().unwrap().map(|(k, _)| *k).collect();
    assert_eq!(keys_b, vec![1]);
    assert!(txn_b.get(&2).unwrap().is_none());

    // ... while the current head shows both.
    let keys: Vec<u64> = tree.iter().unwrap().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![1, 2]);
}

#[test]
fn test_tree_commit_conflict() {
    let tree = new_tree("test_tree_conflict");
    tree.set(0, 0).unwrap();

    let mut txn_a = tree.transaction().unwrap();
    let mut txn_b = tree.transaction().unwrap();
    txn_a.insert(1, 10).unwrap();
    txn_b.insert(2, 20).unwrap();

    assert!(txn_a.commit().unwrap());
    let n_blobs = tree.store().len();

    // B raced the same head version and must lose ...
    assert!(!txn_b.commit().unwrap());

    // ... leaving no trace: its blobs are freed, its key invisible.
    assert_eq!(tree.store().len(), n_blobs);
    assert!(tree.get(&2).unwrap().is_none());
    assert_eq!(*tree.get(&1).unwrap().unwrap(), 10);
    tree.validate().unwrap();
}

#[test]
fn test_tree_abort() {
    let tree = new_tree("test_tree_abort");
    tree.set(1, 10).unwrap();
    let n_blobs = tree.store().len();

    let mut txn = tree.transaction().unwrap();
    txn.insert(2, 20).unwrap();
    let stats = txn.to_stats();
    assert!(stats.n_new > 0);
    assert!(stats.n_discarded > 0);
    txn.abort();

    assert_eq!(tree.store().len(), n_blobs);
    assert!(tree.get(&2).unwrap().is_none());

    // dropping an uncommitted transaction aborts it too.
    {
        let mut txn = tree.transaction().unwrap();
        txn.insert(3, 30).unwrap();
    }
    assert_eq!(tree.store().len(), n_blobs);
    assert!(tree.get(&3).unwrap().is_none());
}

#[test]
fn test_tree_version_chain() {
    let tree = new_tree("test_tree_versions");
    for k in 0..5_u64 {
        tree.set(k, k).unwrap();
    }

    // the head chain enumerates one version per commit.
    let store = tree.store();
    let head = store.get::<HeadNode>(HEAD_INDEX).unwrap();
    assert_eq!(head.version, 5);
    let mut previous = head.previous as usize;
    let mut version = head.version;
    while version > 0 {
        let head = store.get::<HeadNode>(previous).unwrap();
        assert_eq!(head.version, version - 1);
        version = head.version;
        previous = head.previous as usize;
    }
}

#[test]
fn test_tree_random_model() {
    let seed: u64 = random();
    println!("test_tree_random_model seed:{}", seed);
    let mut rng = SmallRng::seed_from_u64(seed);

    let tree = new_tree("test_tree_random_model");
    let mut model: BTreeMap<u64, u64> = BTreeMap::new();

    let mut keys: Vec<u64> = (0..10_000).collect();
    keys.shuffle(&mut rng);
    for &k in keys.iter() {
        tree.set(k, k.wrapping_mul(2685821657736338717)).unwrap();
        model.insert(k, k.wrapping_mul(2685821657736338717));
    }
    tree.validate().unwrap();

    keys.shuffle(&mut rng);
    for &k in keys.iter().take(5_000) {
        let deleted = tree.remove(&k).unwrap().unwrap();
        assert_eq!(*deleted, model.remove(&k).unwrap());
    }

    let stats = tree.validate().unwrap();
    assert_eq!(stats.n_entries, model.len());

    // the surviving entries enumerate exactly like the model.
    let entries: Vec<(u64, u64)> = tree.iter().unwrap().map(|(k, v)| (*k, *v)).collect();
    let expected: Vec<(u64, u64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
    assert_eq!(entries, expected);

    // spot-check point lookups.
    for _ in 0..1000 {
        let k = rng.gen::<u64>() % 10_000;
        assert_eq!(tree.get(&k).unwrap().map(|v| *v), model.get(&k).copied());
    }
}

#[test]
fn test_tree_reattach() {
    let name = "test_tree_reattach";
    HeapFactory::unlink(name);
    let factory: Arc<dyn crate::buffer::BufferFactory> = Arc::new(HeapFactory::new());
    {
        let store = Arc::new(BlobStore::create(Arc::clone(&factory), Config::new(name)).unwrap());
        let tree: BPlusTree<u64, u64, 4> = BPlusTree::create(store).unwrap();
        for k in 0..20_u64 {
            tree.set(k, 7 * k).unwrap();
        }
    }

    // a second attach over the same buffers sees the committed tree.
    let store = Arc::new(BlobStore::create(factory, Config::new(name)).unwrap());
    let tree: BPlusTree<u64, u64, 4> = BPlusTree::create(store).unwrap();
    for k in 0..20_u64 {
        assert_eq!(*tree.get(&k).unwrap().unwrap(), 7 * k);
    }
    let head = tree.store().get::<HeadNode>(HEAD_INDEX).unwrap();
    assert_eq!(head.version, 20);
    tree.validate().unwrap();
}

#[test]
fn test_tree_concurrent_writers() {
    let seed: u64 = random();
    println!("test_tree_concurrent_writers seed:{}", seed);

    let tree = Arc::new(new_tree("test_tree_concurrent"));
    let n_threads = 4_u64;
    let n_keys = 100_u64;

    let mut handles = vec![];
    for t in 0..n_threads {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed + t);
            for i in 0..n_keys {
                let k = t * n_keys + i;
                tree.set(k, k + 1).unwrap();
                if rng.gen::<u8>() % 8 == 0 {
                    thread::yield_now();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // every writer's commit eventually won a round.
    for k in 0..n_threads * n_keys {
        assert_eq!(*tree.get(&k).unwrap().unwrap(), k + 1, "key {}", k);
    }
    let stats = tree.validate().unwrap();
    assert_eq!(stats.n_entries, (n_threads * n_keys) as usize);
}
